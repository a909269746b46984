/*
 *  pacer.rs
 *
 *  ledwire - pixels on the wire
 *	(c) 2020-26 Stuart Hunter
 *
 *	Frame pacing for the streaming loop
 *
 *	This program is free software: you can redistribute it and/or modify
 *	it under the terms of the GNU General Public License as published by
 *	the Free Software Foundation, either version 3 of the License, or
 *	(at your option) any later version.
 *
 *	This program is distributed in the hope that it will be useful,
 *	but WITHOUT ANY WARRANTY; without even the implied warranty of
 *	MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *	GNU General Public License for more details.
 *
 *	See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *	Public License.
 *
 */
use std::time::{Duration, Instant};

pub struct Pacer {
    next_deadline: Instant,
    frame: Duration,
}

fn frame_period(fps: u32) -> Duration {
    Duration::from_micros((1_000_000u32 / fps.max(1)) as u64)
}

impl Pacer {
    pub fn new(target_fps: u32) -> Self {
        Self { next_deadline: Instant::now(), frame: frame_period(target_fps) }
    }

    #[inline]
    pub fn set_fps(&mut self, fps: u32) {
        self.frame = frame_period(fps);
    }

    pub fn fps(&self) -> u32 {
        (1_000_000 / self.frame.as_micros().max(1)) as u32
    }

    /// Returns true if a frame is due; if true, it also schedules the next deadline.
    #[inline]
    pub fn should_flush(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.next_deadline {
            self.next_deadline = now + self.frame;
            true
        } else {
            false
        }
    }

    /// Sleep until the next frame is due, then schedule the one after
    pub fn wait(&mut self) {
        let now = Instant::now();
        if self.next_deadline > now {
            std::thread::sleep(self.next_deadline - now);
        }
        self.next_deadline = Instant::now().max(self.next_deadline) + self.frame;
    }
}

/// Backs the frame rate off when fleet flushes get slow
pub struct AutoPacer {
    pacer: Pacer,
    ema_ms: f32,     // moving avg of flush time
    alpha: f32,      // smoothing (0.1 ~ 0.3)
    headroom: f32,   // >1.0 to avoid saturation (e.g. 1.25)
    max_fps: u32,    // user cap
    min_fps: u32,    // floor
}

impl AutoPacer {
    pub fn new(initial_fps: u32, max_fps: u32, min_fps: u32) -> Self {
        Self {
            pacer: Pacer::new(initial_fps),
            ema_ms: 0.0,
            alpha: 0.2,
            headroom: 1.25,
            max_fps,
            min_fps,
        }
    }

    pub fn should_flush(&mut self) -> bool { self.pacer.should_flush() }

    pub fn wait(&mut self) { self.pacer.wait() }

    pub fn fps(&self) -> u32 { self.pacer.fps() }

    /// Call after each poll/write/flush pass over the fleet.
    pub fn record_flush_ms(&mut self, flush_ms: f32) {
        self.ema_ms = if self.ema_ms == 0.0 {
            flush_ms
        } else {
            self.alpha * flush_ms + (1.0 - self.alpha) * self.ema_ms
        };
        if self.ema_ms > 0.0 {
            let safe_fps = (1000.0 / (self.ema_ms * self.headroom)).clamp(self.min_fps as f32, self.max_fps as f32) as u32;
            self.pacer.set_fps(safe_fps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_is_due_immediately() {
        let mut pacer = Pacer::new(50);
        assert!(pacer.should_flush());
        assert!(!pacer.should_flush());
        assert_eq!(pacer.fps(), 50);
    }

    #[test]
    fn test_auto_pacer_backs_off_and_clamps() {
        let mut auto = AutoPacer::new(60, 60, 10);
        auto.record_flush_ms(40.0);
        assert_eq!(auto.fps(), 20);
        auto.record_flush_ms(1000.0);
        assert_eq!(auto.fps(), 10);
    }
}
