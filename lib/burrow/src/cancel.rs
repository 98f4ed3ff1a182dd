use crossbeam_channel::{bounded, Receiver, TryRecvError};

/// Cooperative cancellation built on channel disconnection: the token's
/// channel becomes ready (with a disconnect error) once every `Canceller`
/// clone is dropped. Workers select on `token.channel()` alongside their
/// work queues and exit when the arm fires.
pub struct Canceller {
    _tx: crossbeam_channel::Sender<()>,
}

#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

pub fn cancel_pair() -> (Canceller, CancelToken) {
    let (tx, rx) = bounded::<()>(0);
    (Canceller { _tx: tx }, CancelToken { rx })
}

impl Canceller {
    /// Trips the token. Dropping the canceller has the same effect, which
    /// ties worker lifetime to owner lifetime.
    #[inline]
    pub fn cancel(self) {}
}

impl CancelToken {
    /// A token that never fires; for components without a parent.
    pub fn detached() -> CancelToken {
        let (tx, rx) = bounded::<()>(0);
        std::mem::forget(tx);
        CancelToken { rx }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// The channel to select on. Never carries messages; it only
    /// disconnects.
    #[inline]
    pub fn channel(&self) -> &Receiver<()> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_trips_token() {
        let (canceller, token) = cancel_pair();
        assert!(!token.is_cancelled());
        canceller.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_drop_trips_token() {
        let (canceller, token) = cancel_pair();
        drop(canceller);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let (canceller, token) = cancel_pair();
        let clone = token.clone();
        canceller.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_detached_never_fires() {
        let token = CancelToken::detached();
        assert!(!token.is_cancelled());
    }
}
