use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::status::Status;

/// What a publisher does when a publish would exceed its flow-control limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitExceededBehavior {
    /// Wait cooperatively until outstanding work drains.
    Block,
    /// Fail the publish with `ResourceExhausted`.
    Error,
    /// Admit the message anyway.
    Ignore,
}

/// Bounds on work a publisher may have outstanding at once.
#[derive(Clone, Debug)]
pub struct FlowControlSettings {
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
    pub limit_exceeded_behavior: LimitExceededBehavior,
}

impl Default for FlowControlSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 1000,
            max_outstanding_bytes: 1 << 30,
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }
    }
}

/// Admission gate shared by all workers of one publisher.
pub(crate) struct FlowController {
    behavior: LimitExceededBehavior,
    max_bytes: usize,
    messages: Arc<Semaphore>,
    bytes: Arc<Semaphore>,
}

/// Held while a message is outstanding; dropping it releases the slots.
#[derive(Debug)]
pub(crate) struct FlowPermit {
    _message: Option<OwnedSemaphorePermit>,
    _bytes: Option<OwnedSemaphorePermit>,
}

impl FlowController {
    pub fn new(settings: &FlowControlSettings) -> Self {
        let max_bytes = settings.max_outstanding_bytes.max(1);
        Self {
            behavior: settings.limit_exceeded_behavior,
            max_bytes,
            messages: Arc::new(Semaphore::new(settings.max_outstanding_messages.max(1))),
            bytes: Arc::new(Semaphore::new(max_bytes)),
        }
    }

    /// Reserves one message slot and `size` bytes.
    ///
    /// A message larger than the whole byte budget is admitted alone rather
    /// than deadlocking: its reservation is clamped to the budget.
    pub async fn acquire(&self, size: usize) -> Result<FlowPermit, Status> {
        let size = size.min(self.max_bytes) as u32;
        match self.behavior {
            LimitExceededBehavior::Ignore => Ok(FlowPermit {
                _message: None,
                _bytes: None,
            }),
            LimitExceededBehavior::Block => {
                let message = self
                    .messages
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Status::internal("flow controller closed"))?;
                let bytes = self
                    .bytes
                    .clone()
                    .acquire_many_owned(size)
                    .await
                    .map_err(|_| Status::internal("flow controller closed"))?;
                Ok(FlowPermit {
                    _message: Some(message),
                    _bytes: Some(bytes),
                })
            }
            LimitExceededBehavior::Error => {
                let message = self
                    .messages
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| Status::resource_exhausted("publisher flow control: outstanding message limit"))?;
                let bytes = self
                    .bytes
                    .clone()
                    .try_acquire_many_owned(size)
                    .map_err(|_| Status::resource_exhausted("publisher flow control: outstanding byte limit"))?;
                Ok(FlowPermit {
                    _message: Some(message),
                    _bytes: Some(bytes),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_behavior_exhausts() {
        let controller = FlowController::new(&FlowControlSettings {
            max_outstanding_messages: 1,
            max_outstanding_bytes: 100,
            limit_exceeded_behavior: LimitExceededBehavior::Error,
        });
        let permit = controller.acquire(10).await.unwrap();
        let err = controller.acquire(10).await.unwrap_err();
        assert_eq!(err.code(), crate::status::Code::ResourceExhausted);
        drop(permit);
        assert!(controller.acquire(10).await.is_ok());
    }

    #[tokio::test]
    async fn test_block_behavior_waits_for_release() {
        let controller = Arc::new(FlowController::new(&FlowControlSettings {
            max_outstanding_messages: 1,
            max_outstanding_bytes: 100,
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }));
        let permit = controller.acquire(10).await.unwrap();
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire(10).await.map(|_| ()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(permit);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_admitted_alone() {
        let controller = FlowController::new(&FlowControlSettings {
            max_outstanding_messages: 10,
            max_outstanding_bytes: 100,
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        });
        let _permit = controller.acquire(1000).await.unwrap();
    }
}
