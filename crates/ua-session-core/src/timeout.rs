//! Bounded waits on engine requests

use std::future::Future;
use std::time::Duration;

use tracing::error;

use crate::adapter::EngineResult;
use crate::error::{ClientError, ClientResult};

/// Run `future`, failing with `OperationTimeout` if it does not finish in time
pub async fn with_timeout<T, F>(operation_name: &str, timeout: Duration, future: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(ClientError::OperationTimeout {
                operation: operation_name.to_string(),
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}

/// [`with_timeout`] for a raw engine call
pub async fn engine_call<T, F>(operation_name: &str, timeout: Duration, future: F) -> ClientResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    with_timeout(operation_name, timeout, async { future.await.map_err(ClientError::from) }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::EngineError;
    use tracing_test::traced_test;

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_with_timeout_expires() {
        let result: ClientResult<()> = with_timeout("publish", Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result.unwrap_err(),
            ClientError::OperationTimeout {
                operation: "publish".into(),
                duration_ms: 100
            }
        );
        assert!(logs_contain("Operation timed out"));
    }

    #[tokio::test]
    async fn test_engine_call_maps_errors() {
        let result: ClientResult<()> =
            engine_call("hold", Duration::from_secs(1), async { Err(EngineError::NotStarted) }).await;
        assert!(matches!(result, Err(ClientError::Engine { .. })));
    }
}
