use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{OutputFrame, PhysicalLink};
use crate::{BeatlightError, Result};

/// How long the drain thread waits for a frame before rechecking its stop
/// flag.
const DRAIN_POLL: Duration = Duration::from_millis(20);

struct Session {
    link: Box<dyn PhysicalLink>,
    running: bool,
}

struct Drainer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Ordered queue of encoded frames in front of a [`PhysicalLink`].
///
/// Producers call [`OutputChannel::enqueue`] from any thread without ever
/// touching the link lock. Frames leave the queue either through explicit
/// [`OutputChannel::drain`] calls or through a dedicated drain thread,
/// never both.
pub struct OutputChannel {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    session: Mutex<Session>,
    drainer: Mutex<Option<Drainer>>,
    dedicated_drainer: bool,
    fault: Mutex<Option<BeatlightError>>,
}

impl OutputChannel {
    pub fn new(link: impl PhysicalLink + 'static, dedicated_drainer: bool) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            session: Mutex::new(Session {
                link: Box::new(link),
                running: false,
            }),
            drainer: Mutex::new(None),
            dedicated_drainer,
            fault: Mutex::new(None),
        }
    }

    pub fn enqueue(&self, frame: OutputFrame) {
        // The channel owns the receiver, so the queue can never disconnect.
        let _ = self.sender.send(frame.encode());
    }

    /// Number of frames waiting to be written.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn has_dedicated_drainer(&self) -> bool {
        self.dedicated_drainer
    }

    pub fn is_running(&self) -> bool {
        self.lock_session().map(|session| session.running).unwrap_or(false)
    }

    /// Opens the link and queues START. Frames left over from an earlier
    /// session are discarded first.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut drainer = self.lock_drainer()?;
        {
            let mut session = self.lock_session()?;
            if session.running {
                return Ok(());
            }
            let stale = self.discard_queued();
            if stale > 0 {
                tracing::debug!(stale, "discarded frames queued while stopped");
            }
            session.link.open()?;
            session.running = true;
            self.enqueue(OutputFrame::Start);
        }

        if self.dedicated_drainer {
            let stop = Arc::new(AtomicBool::new(false));
            let channel = Arc::clone(self);
            let flag = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name("led-drain".to_string())
                .spawn(move || channel.drain_loop(&flag))?;
            *drainer = Some(Drainer { stop, handle });
        }
        tracing::info!(dedicated = self.dedicated_drainer, "output channel started");
        Ok(())
    }

    /// Stops the drain thread if there is one, writes whatever is still
    /// queued, sends EXIT and closes the link. The link is closed even when
    /// a write fails; the first error is returned. A session already ended
    /// by a write failure only has its leftover frames discarded.
    pub fn stop(&self) -> Result<()> {
        let drainer = self.lock_drainer()?.take();
        if let Some(drainer) = drainer {
            drainer.stop.store(true, Ordering::Release);
            drainer
                .handle
                .join()
                .map_err(|_| BeatlightError::msg("led drain thread panicked"))?;
        }

        let mut session = self.lock_session()?;
        if !session.running {
            self.discard_queued();
            return Ok(());
        }
        let flushed = self.write_queued(&mut session, None).map(|_| ());
        let exit = session.link.write_all(&OutputFrame::Exit.encode());
        let closed = session.link.close();
        session.running = false;
        self.discard_queued();
        tracing::info!("output channel stopped");

        flushed.and(exit).and(closed)
    }

    /// Writes every queued frame in one call. Returns the number of frames
    /// written; nothing is written when the queue is empty. A failed write
    /// ends the session: EXIT is attempted, the link closed and the queue
    /// emptied before the error is returned.
    pub fn drain(&self) -> Result<usize> {
        if self.lock_drainer()?.is_some() {
            return Err(BeatlightError::QueueMisuse);
        }
        let mut session = self.lock_session()?;
        if !session.running {
            return Err(BeatlightError::LinkClosed);
        }
        match self.write_queued(&mut session, None) {
            Ok(frames) => Ok(frames),
            Err(err) => {
                self.abort(&mut session, &err);
                Err(err)
            }
        }
    }

    /// Takes the error that ended the drain thread, if any.
    pub fn take_fault(&self) -> Option<BeatlightError> {
        self.fault.lock().ok().and_then(|mut fault| fault.take())
    }

    fn drain_loop(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            let first = match self.receiver.recv_timeout(DRAIN_POLL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let mut session = match self.lock_session() {
                Ok(session) => session,
                Err(err) => {
                    self.record_fault(err);
                    break;
                }
            };
            if let Err(err) = self.write_queued(&mut session, Some(first)) {
                self.abort(&mut session, &err);
                self.record_fault(err);
                break;
            }
        }
    }

    /// Ends a session after a failed write so nothing keeps queueing into a
    /// dead link.
    fn abort(&self, session: &mut Session, err: &BeatlightError) {
        tracing::error!(%err, "led link write failed; closing output");
        if let Err(exit) = session.link.write_all(&OutputFrame::Exit.encode()) {
            tracing::debug!(%exit, "could not send EXIT after write failure");
        }
        if let Err(close) = session.link.close() {
            tracing::warn!(%close, "could not close led link");
        }
        session.running = false;
        let dropped = self.discard_queued();
        tracing::debug!(dropped, "discarded frames of the failed session");
    }

    fn record_fault(&self, err: BeatlightError) {
        if let Ok(mut fault) = self.fault.lock() {
            *fault = Some(err);
        }
    }

    fn write_queued(&self, session: &mut Session, first: Option<Vec<u8>>) -> Result<usize> {
        if !session.running {
            return Err(BeatlightError::LinkClosed);
        }
        let queued = self.receiver.len();
        let mut buffer = first.unwrap_or_default();
        let mut frames = usize::from(!buffer.is_empty());
        for frame in self.receiver.try_iter().take(queued) {
            buffer.extend_from_slice(&frame);
            frames += 1;
        }
        if frames == 0 {
            return Ok(0);
        }
        session.link.write_all(&buffer)?;
        tracing::trace!(frames, bytes = buffer.len(), "wrote led frames");
        Ok(frames)
    }

    fn discard_queued(&self) -> usize {
        self.receiver.try_iter().count()
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| BeatlightError::msg("output link has been poisoned"))
    }

    fn lock_drainer(&self) -> Result<MutexGuard<'_, Option<Drainer>>> {
        self.drainer
            .lock()
            .map_err(|_| BeatlightError::msg("output drainer has been poisoned"))
    }
}

impl fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputChannel")
            .field("pending", &self.pending())
            .field("dedicated_drainer", &self.dedicated_drainer)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::link::MemoryLink;

    fn channel(dedicated: bool) -> (Arc<OutputChannel>, MemoryLink) {
        let link = MemoryLink::new();
        (Arc::new(OutputChannel::new(link.clone(), dedicated)), link)
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn drain_batches_in_order_and_is_idempotent() {
        let (channel, link) = channel(false);
        channel.start().unwrap();
        channel.enqueue(OutputFrame::set_pixel(7, 0x010203).unwrap());
        channel.enqueue(OutputFrame::Flush);

        assert_eq!(channel.drain().unwrap(), 3);
        assert_eq!(channel.drain().unwrap(), 0);
        assert_eq!(link.writes(), vec![vec![1, 9, 0, 3, 2, 1, 1, 0]]);
    }

    #[test]
    fn start_then_stop_brackets_the_session() {
        let (channel, link) = channel(false);
        channel.start().unwrap();
        channel.stop().unwrap();
        channel.stop().unwrap();

        let frames = OutputFrame::decode_session(&link.bytes()).unwrap();
        assert_eq!(frames, vec![OutputFrame::Start, OutputFrame::Exit]);
        assert_eq!((link.opens(), link.closes()), (1, 1));
        assert!(!channel.is_running());
    }

    #[test]
    fn drain_before_start_is_refused() {
        let (channel, _link) = channel(false);
        channel.enqueue(OutputFrame::Flush);
        assert!(matches!(channel.drain(), Err(BeatlightError::LinkClosed)));
        assert_eq!(channel.pending(), 1);
    }

    #[test]
    fn dedicated_drainer_streams_frames() {
        let (channel, link) = channel(true);
        channel.start().unwrap();
        assert!(matches!(channel.drain(), Err(BeatlightError::QueueMisuse)));

        for index in 0..50 {
            channel.enqueue(OutputFrame::set_pixel(index, 0x111111).unwrap());
        }
        channel.enqueue(OutputFrame::Flush);
        wait_for(|| channel.pending() == 0);
        channel.stop().unwrap();

        let frames = OutputFrame::decode_session(&link.bytes()).unwrap();
        assert_eq!(frames.len(), 53);
        assert_eq!(frames.first(), Some(&OutputFrame::Start));
        assert_eq!(frames[1], OutputFrame::SetPixel { index: 0, color: 0x111111 });
        assert_eq!(frames[50], OutputFrame::SetPixel { index: 49, color: 0x111111 });
        assert_eq!(frames[51], OutputFrame::Flush);
        assert_eq!(frames.last(), Some(&OutputFrame::Exit));
    }

    #[test]
    fn write_failure_ends_drainer_and_closes_the_link() {
        let (channel, link) = channel(true);
        link.set_failing(true);
        channel.start().unwrap();
        wait_for(|| !channel.is_running());

        assert!(!link.is_open());
        assert_eq!(link.closes(), 1);
        assert!(matches!(channel.take_fault(), Some(BeatlightError::Io(_))));

        channel.enqueue(OutputFrame::Flush);
        channel.stop().unwrap();
        assert_eq!(channel.pending(), 0);
        assert_eq!(link.closes(), 1);
    }

    #[test]
    fn failed_drain_ends_the_session() {
        let (channel, link) = channel(false);
        channel.start().unwrap();
        link.set_failing(true);
        channel.enqueue(OutputFrame::Flush);

        assert!(matches!(channel.drain(), Err(BeatlightError::Io(_))));
        assert!(!channel.is_running());
        assert!(!link.is_open());
        assert_eq!(channel.pending(), 0);
        assert!(matches!(channel.drain(), Err(BeatlightError::LinkClosed)));

        link.set_failing(false);
        channel.start().unwrap();
        channel.stop().unwrap();
        assert_eq!(link.opens(), 2);
        assert_eq!(
            OutputFrame::decode_session(&link.bytes()).unwrap(),
            vec![OutputFrame::Start, OutputFrame::Exit]
        );
    }

    #[test]
    fn restart_drops_frames_queued_while_stopped() {
        let (channel, link) = channel(false);
        channel.enqueue(OutputFrame::Flush);
        channel.start().unwrap();
        channel.drain().unwrap();
        channel.stop().unwrap();

        assert_eq!(link.writes()[0], vec![1]);
    }
}
