//! NATS subject definitions

/// Subject on which the Cloud Controller publishes staging requests
pub const STAGING_START: &str = "diego.staging.start";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_start_subject() {
        assert_eq!(STAGING_START, "diego.staging.start");
    }
}
