use super::CameraSource;

/// Number of camera indices probed by [`locate`].
pub const MAX_PROBED_INDEX: u32 = 10;

/// Finds the first camera index that can be opened and delivers a frame.
///
/// Indices `0..10` are tried in ascending order. For every index, `open` is called once and, if it
/// succeeds, exactly one frame is read. Each failed candidate is dropped before the next index is
/// tried, and the working one is dropped before returning, so the caller has to reopen the
/// returned index (typically with different options).
///
/// Returns `None` if no index yields a frame.
pub fn locate<C, F>(mut open: F) -> Option<u32>
where
    C: CameraSource,
    F: FnMut(u32) -> anyhow::Result<C>,
{
    for index in 0..MAX_PROBED_INDEX {
        log::info!("trying camera index {index}");
        let mut camera = match open(index) {
            Ok(camera) => camera,
            Err(e) => {
                log::debug!("failed to open camera {index}: {e:#}");
                continue;
            }
        };

        match camera.read() {
            Ok(_) => {
                let info = camera.info();
                let fps = match info.fps {
                    Some(fps) => format!("{fps:.1}"),
                    None => "unknown".into(),
                };
                log::info!(
                    "found working camera at index {index}: {}x{}, {fps} FPS",
                    info.resolution.width(),
                    info.resolution.height(),
                );
                return Some(index);
            }
            Err(e) => log::debug!("camera {index} opened but failed to deliver a frame: {e:#}"),
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;

    use crate::image::{Image, Resolution};
    use crate::video::CameraInfo;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Event {
        Open(u32),
        Read(u32),
        Release(u32),
    }

    type Log = Arc<Mutex<Vec<Event>>>;

    struct Fake {
        index: u32,
        readable: bool,
        log: Log,
    }

    impl CameraSource for Fake {
        fn read(&mut self) -> anyhow::Result<Image> {
            self.log.lock().unwrap().push(Event::Read(self.index));
            if !self.readable {
                bail!("no frame");
            }
            Ok(Image::new(4, 4))
        }

        fn info(&self) -> CameraInfo {
            CameraInfo {
                name: format!("fake{}", self.index),
                resolution: Resolution::new(4, 4),
                fps: Some(30.0),
            }
        }
    }

    impl Drop for Fake {
        fn drop(&mut self) {
            self.log.lock().unwrap().push(Event::Release(self.index));
        }
    }

    fn opener(
        log: &Log,
        openable: impl Fn(u32) -> bool,
        readable: impl Fn(u32) -> bool,
    ) -> impl FnMut(u32) -> anyhow::Result<Fake> {
        let log = log.clone();
        move |index| {
            log.lock().unwrap().push(Event::Open(index));
            if !openable(index) {
                bail!("no such device");
            }
            Ok(Fake {
                index,
                readable: readable(index),
                log: log.clone(),
            })
        }
    }

    #[test]
    fn returns_first_working_index() {
        let log = Log::default();
        let found = locate(opener(&log, |i| i == 3, |_| true));
        assert_eq!(found, Some(3));

        let events = log.lock().unwrap();
        let opens = events.iter().filter(|e| matches!(e, Event::Open(_))).count();
        assert_eq!(opens, 4);
        assert_eq!(
            events[3..],
            [Event::Open(3), Event::Read(3), Event::Release(3)]
        );
    }

    #[test]
    fn nothing_found() {
        let log = Log::default();
        assert_eq!(locate(opener(&log, |_| false, |_| true)), None);
        assert_eq!(
            *log.lock().unwrap(),
            (0..10).map(Event::Open).collect::<Vec<_>>()
        );
    }

    #[test]
    fn unreadable_cameras_are_released_before_next_open() {
        let log = Log::default();
        let found = locate(opener(&log, |i| i >= 1, |i| i == 2));
        assert_eq!(found, Some(2));
        assert_eq!(
            *log.lock().unwrap(),
            [
                Event::Open(0),
                Event::Open(1),
                Event::Read(1),
                Event::Release(1),
                Event::Open(2),
                Event::Read(2),
                Event::Release(2),
            ]
        );
    }
}
