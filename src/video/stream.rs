use std::{
    io,
    panic::resume_unwind,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::{CameraSource, Frame};

/// A camera running on a background thread, buffering only the freshest frames.
///
/// The capture thread reads frames as fast as the camera delivers them and pushes them into a
/// queue of capacity [`VideoStream::CAPACITY`]. Whenever a frame arrives while an older one is
/// still pending, the older frame is dropped. A consumer calling [`VideoStream::read`] therefore
/// never sees a backlog of stale frames, at the cost of skipping frames when it falls behind. If
/// the consumer keeps up, every frame is delivered in capture order.
pub struct VideoStream {
    frames: Receiver<Frame>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    stopped: AtomicBool,
    reads: AtomicU64,
}

impl VideoStream {
    /// Maximum number of frames waiting in the buffer.
    pub const CAPACITY: usize = 2;

    /// Spawns the capture thread for `source` and starts buffering frames.
    ///
    /// The source is moved onto the capture thread and dropped (releasing the device) when the
    /// stream is stopped.
    pub fn start<C: CameraSource + 'static>(source: C) -> io::Result<Self> {
        let (sender, frames) = crossbeam_channel::bounded(Self::CAPACITY);
        let shared = Arc::new(Shared {
            stopped: AtomicBool::new(false),
            reads: AtomicU64::new(0),
        });
        let capture = Capture {
            source,
            sender,
            evict: frames.clone(),
            shared: shared.clone(),
            sequence: 0,
        };
        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || capture.run())?;

        Ok(Self {
            frames,
            shared,
            handle: Some(handle),
        })
    }

    /// Removes and returns the oldest buffered frame, blocking until one is available.
    ///
    /// Returns `None` once the capture thread has exited (after [`VideoStream::stop`] was
    /// requested or the thread panicked) and all buffered frames have been consumed.
    pub fn read(&self) -> Option<Frame> {
        self.frames.recv().ok()
    }

    /// Returns the number of frames currently waiting in the buffer.
    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of frames successfully captured so far, including evicted ones.
    pub fn reads(&self) -> u64 {
        self.shared.reads.load(Ordering::Acquire)
    }

    /// Stops the capture thread and releases the camera.
    ///
    /// This waits for an in-progress camera read to finish. Once this returns, the camera will not
    /// be read again. If the capture thread has panicked, the panic is propagated to the caller.
    pub fn stop(mut self) {
        self.stop_impl();
    }

    fn stop_impl(&mut self) {
        self.shared.stopped.store(true, Ordering::Relaxed);

        // Wait for it to exit and propagate its panic if it panicked.
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(()) => log::debug!("video stream stopped after {} frames", self.reads()),
                Err(payload) => {
                    if !thread::panicking() {
                        resume_unwind(payload);
                    }
                }
            }
        }
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.stop_impl();
    }
}

struct Capture<C> {
    source: C,
    sender: Sender<Frame>,
    /// Receiving half of the same queue, used to evict the oldest pending frame.
    evict: Receiver<Frame>,
    shared: Arc<Shared>,
    sequence: u64,
}

impl<C: CameraSource> Capture<C> {
    fn run(mut self) {
        log::trace!("capture thread starting");

        let mut failing = false;
        while !self.shared.stopped.load(Ordering::Relaxed) {
            if self.sender.is_full() {
                thread::yield_now();
                continue;
            }

            // Failed reads are retried right away; cameras usually recover on the next frame.
            match self.source.read() {
                Ok(image) => {
                    if failing {
                        log::debug!("camera recovered");
                        failing = false;
                    }
                    let frame = Frame {
                        image,
                        sequence: self.sequence,
                        captured_at: Instant::now(),
                    };
                    self.sequence += 1;
                    self.push(frame);
                    self.shared.reads.store(self.sequence, Ordering::Release);
                }
                Err(e) => {
                    if !failing {
                        log::debug!("failed to read camera frame: {e:#}");
                        failing = true;
                    }
                }
            }
        }

        log::trace!("capture thread exiting, releasing camera");
    }

    fn push(&self, mut frame: Frame) {
        if !self.sender.is_empty() {
            // The consumer may take the pending frame first, so this is allowed to find nothing.
            self.evict.try_recv().ok();
        }
        loop {
            match self.sender.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    self.evict.try_recv().ok();
                    frame = rejected;
                }
                // We hold a receiver ourselves, so this cannot happen.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    use anyhow::bail;

    use crate::image::{Color, Image, Resolution};
    use crate::video::CameraInfo;

    use super::*;

    fn info() -> CameraInfo {
        CameraInfo {
            name: "fake".into(),
            resolution: Resolution::new(1, 1),
            fps: None,
        }
    }

    fn marked(n: u8) -> Image {
        let mut image = Image::new(1, 1);
        image.set(0, 0, Color::from_rgb8(n, 0, 0));
        image
    }

    /// Delivers exactly the images the test sends; fails once the test drops its sender.
    struct Feed {
        images: Receiver<Image>,
    }

    impl CameraSource for Feed {
        fn read(&mut self) -> anyhow::Result<Image> {
            Ok(self.images.recv()?)
        }

        fn info(&self) -> CameraInfo {
            info()
        }
    }

    fn feed() -> (Sender<Image>, Feed) {
        let (sender, images) = crossbeam_channel::unbounded();
        (sender, Feed { images })
    }

    /// Produces frames as fast as it is asked to and counts the reads.
    struct Counting {
        reads: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
        fail_every: Option<usize>,
    }

    impl CameraSource for Counting {
        fn read(&mut self) -> anyhow::Result<Image> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(k) = self.fail_every {
                if n % k == 0 {
                    bail!("simulated read failure");
                }
            }
            Ok(Image::new(1, 1))
        }

        fn info(&self) -> CameraInfo {
            info()
        }
    }

    impl Drop for Counting {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn counting(fail_every: Option<usize>) -> (Counting, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let source = Counting {
            reads: reads.clone(),
            released: released.clone(),
            fail_every,
        };
        (source, reads, released)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "timed out waiting for condition"
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn delivers_freshest_frame() {
        let (feeder, source) = feed();
        let stream = VideoStream::start(source).unwrap();

        for n in 0..10 {
            feeder.send(marked(n)).unwrap();
        }
        wait_until(|| stream.reads() == 10);

        let frame = stream.read().unwrap();
        assert!(frame.sequence >= 8, "got stale frame {}", frame.sequence);
        assert_eq!(frame.image.get(0, 0).r() as u64, frame.sequence);
        assert!(stream.pending() <= 1);

        drop(feeder);
        stream.stop();
    }

    #[test]
    fn never_exceeds_capacity() {
        let (source, _reads, _released) = counting(None);
        let stream = VideoStream::start(source).unwrap();
        for _ in 0..1000 {
            assert!(stream.pending() <= VideoStream::CAPACITY);
        }
        wait_until(|| stream.reads() > 100);
        assert!(stream.pending() <= VideoStream::CAPACITY);
        stream.stop();
    }

    #[test]
    fn no_loss_when_consumer_keeps_up() {
        let (feeder, source) = feed();
        let stream = VideoStream::start(source).unwrap();

        for n in 0..20 {
            feeder.send(marked(n)).unwrap();
            let frame = stream.read().unwrap();
            assert_eq!(frame.sequence, u64::from(n));
            assert_eq!(frame.image.get(0, 0).r(), n);
        }

        drop(feeder);
        stream.stop();
    }

    #[test]
    fn order_is_preserved_under_jitter() {
        let (feeder, source) = feed();
        let stream = VideoStream::start(source).unwrap();

        let producer = thread::spawn(move || {
            for n in 0..50 {
                feeder.send(marked(n)).unwrap();
                thread::sleep(Duration::from_micros(fastrand::u64(0..2000)));
            }
        });

        let mut last = None;
        let mut received = 0;
        while received < 10 {
            let frame = stream.read().unwrap();
            if let Some(last) = last {
                assert!(frame.sequence > last);
            }
            last = Some(frame.sequence);
            received += 1;
            thread::sleep(Duration::from_micros(fastrand::u64(0..4000)));
        }

        producer.join().unwrap();
        stream.stop();
    }

    #[test]
    fn no_reads_after_stop() {
        let (source, reads, released) = counting(None);
        let stream = VideoStream::start(source).unwrap();
        wait_until(|| reads.load(Ordering::SeqCst) > 10);

        stream.stop();
        assert!(released.load(Ordering::SeqCst));
        let after_stop = reads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(reads.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn failed_reads_are_retried() {
        let (source, reads, _released) = counting(Some(2));
        let stream = VideoStream::start(source).unwrap();

        let first = stream.read().unwrap();
        let second = stream.read().unwrap();
        assert!(second.sequence > first.sequence);
        assert!(reads.load(Ordering::SeqCst) >= 3);
        stream.stop();
    }

    #[test]
    fn stop_waits_out_stalled_read() {
        /// A device that never delivers a frame, like a network camera whose server stopped
        /// sending. Every read gives up after a timeout.
        struct Stalled {
            attempts: Arc<AtomicUsize>,
            released: Arc<AtomicBool>,
        }

        impl CameraSource for Stalled {
            fn read(&mut self) -> anyhow::Result<Image> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                bail!("read timed out");
            }

            fn info(&self) -> CameraInfo {
                info()
            }
        }

        impl Drop for Stalled {
            fn drop(&mut self) {
                self.released.store(true, Ordering::SeqCst);
            }
        }

        let attempts = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let stream = VideoStream::start(Stalled {
            attempts: attempts.clone(),
            released: released.clone(),
        })
        .unwrap();
        wait_until(|| attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(stream.pending(), 0);

        let start = Instant::now();
        stream.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn capture_panic_is_propagated() {
        struct Panicking;

        impl CameraSource for Panicking {
            fn read(&mut self) -> anyhow::Result<Image> {
                panic!("camera driver exploded");
            }

            fn info(&self) -> CameraInfo {
                info()
            }
        }

        let stream = VideoStream::start(Panicking).unwrap();
        assert!(stream.read().is_none());
        catch_unwind(AssertUnwindSafe(|| stream.stop())).unwrap_err();
    }
}
