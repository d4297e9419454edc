use banter::hardening::RetryPolicy;
use banter::types::BanterError;

#[tokio::test]
async fn test_retry_policy_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: banter::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Ok(42) }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_retry_policy_eventual_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: banter::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            let a = attempts;
            async move {
                if a < 3 {
                    Err(BanterError::Io(std::io::Error::other("transient")).into())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_retry_policy_gives_up_after_max_attempts() {
    let policy = RetryPolicy::new(2, 1);
    let mut attempts = 0;

    let result: banter::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(BanterError::Io(std::io::Error::other("still down")).into()) }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn test_non_retryable_errors_fail_fast() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: banter::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(BanterError::InvalidIngress("bad payload".to_string()).into()) }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(attempts, 1);
}
