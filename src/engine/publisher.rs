use anyhow::{anyhow, Result};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::core::{Frame, PublishedFrame};

/// Downstream consumer of published frames
///
/// Called synchronously on the publication thread in strictly increasing timestamp order.
/// Errors are reported through the events sink and never stop the pipeline, but a slow
/// publisher delays every frame behind it.
pub trait FramePublisher: Send {
    fn publish(&mut self, frame: &Frame, index: usize) -> Result<()>;
}

impl<F> FramePublisher for F
where
    F: FnMut(&Frame, usize) -> Result<()> + Send,
{
    fn publish(&mut self, frame: &Frame, index: usize) -> Result<()> {
        self(frame, index)
    }
}

/// Forwards owned frame snapshots into a tokio channel
pub struct ChannelPublisher {
    tx: mpsc::Sender<PublishedFrame>,
}

impl ChannelPublisher {
    pub fn new(tx: mpsc::Sender<PublishedFrame>) -> Self {
        Self { tx }
    }

    /// Publisher plus the receiving half of a fresh bounded channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PublishedFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl FramePublisher for ChannelPublisher {
    fn publish(&mut self, frame: &Frame, index: usize) -> Result<()> {
        match self.tx.try_send(frame.to_published(index)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => Err(anyhow!(
                "Frame channel full, dropped frame {}",
                dropped.timestamp
            )),
            Err(TrySendError::Closed(_)) => Err(anyhow!("Frame channel closed")),
        }
    }
}
