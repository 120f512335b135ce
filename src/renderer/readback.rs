//! Pixel Readback
//!
//! [`Renderer::read_render_target_pixels`] stalls until the pixels are
//! available. [`Renderer::read_render_target_pixels_async`] queues the copy
//! into a pixel-pack buffer behind a fence and returns a future that polls
//! the fence with exponential backoff:
//!
//! ```text
//! poll ── fence signaled? ──no──> wait `delay`, delay = min(2 * delay, max)
//!               │
//!              yes
//!               │
//!        read buffer, free buffer and fence
//! ```
//!
//! While waiting, a timer thread wakes the task once the delay has passed;
//! the future never wakes itself.
//!
//! The future holds the renderer borrowed, so no frame can be rendered
//! while a read is in flight. Dropping it early frees the buffer and fence.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;

use web_time::Instant;

use super::Renderer;
use crate::errors::{RenderError, Result};
use crate::renderer::device::{
    BufferTarget, GpuBuffer, GpuDevice, GpuFence, GpuFramebuffer, PixelRect,
};
use crate::renderer::settings::ReadbackSettings;
use crate::resources::RenderTargetId;

impl<D: GpuDevice> Renderer<D> {
    /// Copies RGBA8 pixels of `target` into `out`, which must hold exactly
    /// `rect.width * rect.height * 4` bytes.
    pub fn read_render_target_pixels(
        &mut self,
        target: RenderTargetId,
        rect: PixelRect,
        out: &mut [u8],
    ) -> Result<()> {
        if self.device.is_context_lost() {
            return Err(RenderError::ContextLost);
        }
        let framebuffer = self.readable_framebuffer(target, rect, out.len())?;
        self.state.bind_framebuffer(&mut self.device, Some(framebuffer));
        self.device.read_pixels(rect, out)
    }

    /// Queues a read of `target` and returns a future resolving to the
    /// pixels once the GPU has finished.
    pub fn read_render_target_pixels_async(
        &mut self,
        target: RenderTargetId,
        rect: PixelRect,
    ) -> Result<ReadPixelsFuture<'_>> {
        if self.device.is_context_lost() {
            return Err(RenderError::ContextLost);
        }
        let len = byte_len(rect);
        let framebuffer = self.readable_framebuffer(target, rect, len)?;
        self.state.bind_framebuffer(&mut self.device, Some(framebuffer));

        let buffer = self
            .device
            .create_buffer(BufferTarget::PixelPack, &vec![0; len]);
        self.device.read_pixels_to_buffer(rect, buffer);
        let fence = self.device.fence();
        log::trace!("Queued async readback of {len} bytes");

        Ok(ReadPixelsFuture {
            device: &mut self.device,
            pending: Some((buffer, fence)),
            len,
            backoff: Backoff::new(self.settings.readback),
            armed: None,
        })
    }

    fn readable_framebuffer(
        &self,
        target: RenderTargetId,
        rect: PixelRect,
        len: usize,
    ) -> Result<GpuFramebuffer> {
        let invalid = RenderError::InvalidConfiguration;

        let desc = self
            .targets
            .desc(target)
            .ok_or_else(|| invalid(format!("unknown render target {target:?}")))?;
        if desc.color != Some(wgpu::TextureFormat::Rgba8Unorm) {
            return Err(invalid(format!(
                "render target color format {:?} cannot be read as RGBA8",
                desc.color
            )));
        }
        let fits = rect.x.checked_add(rect.width).is_some_and(|r| r <= desc.width)
            && rect.y.checked_add(rect.height).is_some_and(|b| b <= desc.height);
        if !fits {
            return Err(invalid(format!(
                "read rect {rect:?} exceeds the {}x{} target",
                desc.width, desc.height
            )));
        }
        if len != byte_len(rect) {
            return Err(invalid(format!(
                "readback buffer holds {len} bytes, {} required",
                byte_len(rect)
            )));
        }
        self.targets
            .resolve_framebuffer(target)
            .ok_or_else(|| invalid(format!("render target {target:?} was never rendered")))
    }
}

fn byte_len(rect: PixelRect) -> usize {
    rect.width as usize * rect.height as usize * 4
}

#[derive(Debug)]
struct Backoff {
    next_poll: Option<Instant>,
    delay: Duration,
    max: Duration,
}

impl Backoff {
    fn new(settings: ReadbackSettings) -> Self {
        Self {
            next_poll: None,
            delay: Duration::from_micros(settings.initial_backoff_us),
            max: Duration::from_micros(settings.max_backoff_us),
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.next_poll.is_none_or(|at| now >= at)
    }

    /// Schedules the next fence check and returns its time.
    fn wait(&mut self, now: Instant) -> Instant {
        let at = now + self.delay;
        self.next_poll = Some(at);
        self.delay = (self.delay * 2).min(self.max);
        at
    }
}

/// Pending async readback. Not cancellable once queued.
pub struct ReadPixelsFuture<'r> {
    device: &'r mut dyn GpuDevice,
    pending: Option<(GpuBuffer, GpuFence)>,
    len: usize,
    backoff: Backoff,
    /// Deadline and waker of the timer currently in flight
    armed: Option<(Instant, Waker)>,
}

impl ReadPixelsFuture<'_> {
    /// Wakes the task at `at`. At most one timer runs per deadline.
    fn wake_at(&mut self, cx: &Context<'_>, at: Instant) {
        if self
            .armed
            .as_ref()
            .is_some_and(|(deadline, waker)| *deadline == at && waker.will_wake(cx.waker()))
        {
            return;
        }
        let waker = cx.waker().clone();
        self.armed = Some((at, waker.clone()));

        let delay = at.saturating_duration_since(Instant::now());
        let spawned = thread::Builder::new()
            .name("readback-backoff".into())
            .spawn(move || {
                thread::sleep(delay);
                waker.wake();
            });
        if let Err(err) = spawned {
            log::warn!("Readback timer unavailable, waking immediately: {err}");
            cx.waker().wake_by_ref();
        }
    }

    fn release(&mut self) {
        if let Some((buffer, fence)) = self.pending.take() {
            self.device.delete_buffer(buffer);
            self.device.delete_fence(fence);
        }
    }
}

impl Future for ReadPixelsFuture<'_> {
    type Output = Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some((buffer, fence)) = this.pending else {
            return Poll::Ready(Err(RenderError::Device(
                "readback polled after completion".into(),
            )));
        };

        if this.device.is_context_lost() {
            this.pending = None;
            return Poll::Ready(Err(RenderError::ContextLost));
        }

        let now = Instant::now();
        if !this.backoff.ready(now) {
            let at = this.backoff.next_poll.unwrap_or(now);
            this.wake_at(cx, at);
            return Poll::Pending;
        }
        if !this.device.fence_signaled(fence) {
            let at = this.backoff.wait(now);
            this.wake_at(cx, at);
            return Poll::Pending;
        }

        let mut out = vec![0; this.len];
        let result = this.device.read_buffer(buffer, &mut out);
        this.release();
        Poll::Ready(result.map(|()| out))
    }
}

impl Drop for ReadPixelsFuture<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_limit() {
        let mut backoff = Backoff::new(ReadbackSettings {
            initial_backoff_us: 50,
            max_backoff_us: 150,
        });
        let now = Instant::now();
        assert!(backoff.ready(now));

        backoff.wait(now);
        assert!(!backoff.ready(now));
        assert_eq!(backoff.delay, Duration::from_micros(100));
        backoff.wait(now);
        backoff.wait(now);
        assert_eq!(backoff.delay, Duration::from_micros(150));
        assert!(backoff.ready(now + Duration::from_millis(1)));
    }
}
