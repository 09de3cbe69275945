use tokio::sync::watch;

use super::worker::PoolGeneration;

/// Builds the channel a pool worker uses to announce generation bumps. Readers see the latest
/// generation without ever contending with the worker.
pub(super) fn channel(initial: PoolGeneration) -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = watch::channel(initial);
    (
        PoolGenerationPublisher { sender },
        PoolGenerationSubscriber { receiver },
    )
}

/// The worker-side half: announces each new generation after a clear.
#[derive(Debug)]
pub(super) struct PoolGenerationPublisher {
    sender: watch::Sender<PoolGeneration>,
}

impl PoolGenerationPublisher {
    pub(super) fn publish(&self, generation: PoolGeneration) {
        // No subscribers is fine; the value still lands in the channel for future readers.
        let _: std::result::Result<_, _> = self.sender.send(generation);
    }
}

/// A read-only view of a pool's current generation, used to judge whether errors came from a
/// connection that predates the latest clear.
#[derive(Clone, Debug)]
pub(crate) struct PoolGenerationSubscriber {
    receiver: watch::Receiver<PoolGeneration>,
}

impl PoolGenerationSubscriber {
    pub(crate) fn generation(&self) -> PoolGeneration {
        self.receiver.borrow().clone()
    }
}
