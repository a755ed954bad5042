//! Performance measurement tools.

use std::{
    cell::Cell,
    fmt::{self, Arguments},
    mem,
    sync::Mutex,
    time::{Duration, Instant},
};

/// A timer that can measure and average the time an operation takes.
///
/// Collected timings are averaged and reset when the timer is displayed using `{}`
/// ([`std::fmt::Display`]).
pub struct Timer {
    name: &'static str,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    total: Duration,
    /// The number of time measurements that contributed to `total`.
    count: u32,
}

impl Timer {
    /// Creates a new timer.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
        }
    }

    /// Invokes a closure, measuring and recording the time it takes.
    pub fn time<T>(&self, timee: impl FnOnce() -> T) -> T {
        let _guard = self.start();
        timee()
    }

    /// Starts timing an operation using a drop guard.
    ///
    /// When the returned [`TimerGuard`] is dropped, the time between the call to `start` and the
    /// drop is measured and recorded.
    pub fn start(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    fn stop(&self, start: Instant) {
        let duration = start.elapsed();
        let mut state = self.state.lock().unwrap();
        state.total += duration;
        state.count += 1;
    }
}

/// Displays the average recorded time and resets it.
impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut state = self.state.lock().unwrap();
        let State { total, count } = mem::take(&mut *state);
        let avg_ms = if count == 0 {
            0.0
        } else {
            total.as_secs_f32() * 1000.0 / count as f32
        };

        write!(f, "{}: {count}x{avg_ms:.01}ms", self.name)
    }
}

/// Cloning a timer resets its collected timings.
impl Clone for Timer {
    fn clone(&self) -> Self {
        Self::new(self.name)
    }
}

/// Guard returned by [`Timer::start`]. Stops timing the operation when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    timer: &'a Timer,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.stop(self.start);
    }
}

/// Computes and logs a rolling frames-per-second estimate.
///
/// Frames are counted until more than one second has passed since the last measurement; then
/// `frames / elapsed` becomes the new [`FpsCounter::fps`] value and counting starts over. The value
/// is `0.0` until the first measurement completes.
pub struct FpsCounter {
    name: String,
    frames: u32,
    start: Instant,
    fps: f32,
}

impl FpsCounter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new<N: Into<String>>(name: N) -> Self {
        Self::starting_at(name, Instant::now())
    }

    /// Creates a counter whose first measurement window starts at `start`.
    pub fn starting_at<N: Into<String>>(name: N, start: Instant) -> Self {
        Self {
            name: name.into(),
            frames: 0,
            start,
            fps: 0.0,
        }
    }

    /// Returns the most recently computed FPS value.
    #[inline]
    pub fn fps(&self) -> f32 {
        self.fps
    }

    /// Advances the frame counter by 1 and logs FPS if one second has passed.
    pub fn tick(&mut self) {
        self.tick_impl(Instant::now(), format_args!(""));
    }

    /// Like [`FpsCounter::tick`], but uses `now` as the current time instead of querying the clock.
    pub fn tick_at(&mut self, now: Instant) {
        self.tick_impl(now, format_args!(""));
    }

    /// Advances the frame counter by 1 and logs FPS and `extra` data if one second has passed.
    pub fn tick_with<D: fmt::Display, I: IntoIterator<Item = D>>(&mut self, extra: I) {
        struct DisplayExtra<D: fmt::Display, I: Iterator<Item = D>>(Cell<Option<I>>);

        impl<D: fmt::Display, I: Iterator<Item = D>> fmt::Display for DisplayExtra<D, I> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let Some(mut iter) = self.0.take() else {
                    return Ok(());
                };
                match iter.next() {
                    Some(item) => {
                        write!(f, " ({}", item)?;
                        for item in iter {
                            write!(f, ", {}", item)?;
                        }
                        f.write_str(")")
                    }
                    None => Ok(()),
                }
            }
        }

        self.tick_impl(
            Instant::now(),
            format_args!("{}", DisplayExtra(Cell::new(Some(extra.into_iter())))),
        );
    }

    fn tick_impl(&mut self, now: Instant, args: Arguments<'_>) {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed > Self::WINDOW {
            self.fps = self.frames as f32 / elapsed.as_secs_f32();
            log::debug!("{}: {:.2} FPS{}", self.name, self.fps, args);

            self.frames = 0;
            self.start = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn fps_starts_at_zero() {
        let start = Instant::now();
        let mut fps = FpsCounter::starting_at("test", start);
        assert_eq!(fps.fps(), 0.0);
        fps.tick_at(start + Duration::from_millis(500));
        assert_eq!(fps.fps(), 0.0);
    }

    #[test]
    fn thirty_frames_in_one_second() {
        let start = Instant::now();
        let mut fps = FpsCounter::starting_at("test", start);
        let frame_time = Duration::from_secs_f64(1.001 / 30.0);
        for i in 1..=30 {
            fps.tick_at(start + frame_time * i);
        }
        assert_relative_eq!(fps.fps(), 30.0, epsilon = 0.1);
    }

    #[test]
    fn value_persists_between_windows() {
        let start = Instant::now();
        let mut fps = FpsCounter::starting_at("test", start);
        for i in 1..=11 {
            fps.tick_at(start + Duration::from_millis(100) * i);
        }
        let measured = fps.fps();
        assert_relative_eq!(measured, 10.0, epsilon = 0.01);

        // A few frames into the next window, the old value is still reported.
        fps.tick_at(start + Duration::from_millis(1200));
        fps.tick_at(start + Duration::from_millis(1300));
        assert_eq!(fps.fps(), measured);
    }

    #[test]
    fn timer_display_resets() {
        let timer = Timer::new("decode");
        timer.time(|| {});
        timer.time(|| {});
        assert!(timer.to_string().starts_with("decode: 2x"));
        assert_eq!(timer.to_string(), "decode: 0x0.0ms");
    }
}
