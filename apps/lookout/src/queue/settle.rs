use std::sync::Mutex;

use tokio::sync::oneshot;

/// Single-resolution completion cell. Any number of callers may race to
/// settle it; exactly one wins, and the paired receiver observes that value
/// once. Keeping the cell alive without settling leaves the receiver
/// pending, which is the behavior a gracefully stopped queue relies on.
#[derive(Debug)]
pub(crate) struct Settle<T> {
    slot: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Settle<T> {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Returns true when this call performed the settle.
    pub(crate) fn settle(&self, value: T) -> bool {
        let sender = self.slot.lock().unwrap().take();
        match sender {
            Some(tx) => {
                // The receiver may already be gone; the cell still counts
                // as settled so later callers lose the race.
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.slot.lock().unwrap().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn first_settle_wins() {
        let (settle, rx) = Settle::channel();
        assert!(!settle.is_settled());
        assert!(settle.settle(1u32));
        assert!(!settle.settle(2u32));
        assert!(settle.is_settled());
        assert_eq!(rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_settlers_resolve_exactly_once() {
        let (settle, rx) = Settle::channel();
        let settle = Arc::new(settle);
        let wins = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for value in 0..8u32 {
            let settle = Arc::clone(&settle);
            let wins = Arc::clone(&wins);
            handles.push(tokio::spawn(async move {
                if settle.settle(value) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn unsettled_receiver_stays_pending() {
        let (settle, mut rx) = Settle::<u32>::channel();
        assert!(rx.try_recv().is_err());
        // Cell intact, so the receiver has not been dropped into an error.
        assert!(!settle.is_settled());
    }
}
