//! Window size hand-over between the window thread and the render thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use vkern_core::LogSink;

#[derive(Debug, Default)]
struct Slot {
    pending: Option<(u32, u32)>,
    paused: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    published: Condvar,
    log: Arc<dyn LogSink>,
}

/// Cloneable handle the window thread uses to publish new sizes.
///
/// The render thread consumes each published size exactly once.
#[derive(Clone)]
pub struct ResizeHandle {
    shared: Arc<Shared>,
}

impl ResizeHandle {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                published: Condvar::new(),
                log,
            }),
        }
    }

    /// Publish a new window size.
    ///
    /// Rendering pauses while either dimension is zero. Pause and resume
    /// are logged once per transition.
    pub fn set_size(&self, width: u32, height: u32) {
        self.shared.log.graph(&format!(
            "VulkanKernel::set_size: set new sizes: width = {width}; height = {height}"
        ));
        let mut slot = self.shared.slot.lock();
        slot.pending = Some((width, height));

        let paused = width == 0 || height == 0;
        if paused != slot.paused {
            slot.paused = paused;
            if paused {
                self.shared.log.log("VulkanKernel: window has been collapsed!");
            } else {
                self.shared.log.log("VulkanKernel: window has been expanded!");
            }
        }

        drop(slot);
        self.shared.published.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.slot.lock().paused
    }

    /// Size published but not yet consumed.
    pub fn pending(&self) -> Option<(u32, u32)> {
        self.shared.slot.lock().pending
    }

    /// Consume the pending size without waiting.
    pub fn take_pending(&self) -> Option<(u32, u32)> {
        self.shared.slot.lock().pending.take()
    }

    /// Block until a size is published, then consume it.
    ///
    /// With a timeout, returns `None` if nothing arrived in time.
    pub fn wait_pending(&self, timeout: Option<Duration>) -> Option<(u32, u32)> {
        let mut slot = self.shared.slot.lock();
        match timeout {
            None => {
                while slot.pending.is_none() {
                    self.shared.published.wait(&mut slot);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while slot.pending.is_none() {
                    if self
                        .shared
                        .published
                        .wait_until(&mut slot, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
            }
        }
        slot.pending.take()
    }
}

impl std::fmt::Debug for ResizeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.shared.slot.lock();
        f.debug_struct("ResizeHandle")
            .field("pending", &slot.pending)
            .field("paused", &slot.paused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use vkern_core::{CaptureSink, LogChannel};

    #[test]
    fn zero_dimension_pauses() {
        let handle = ResizeHandle::new(CaptureSink::shared());
        handle.set_size(0, 600);
        assert!(handle.is_paused());
        handle.set_size(800, 0);
        assert!(handle.is_paused());
        handle.set_size(800, 600);
        assert!(!handle.is_paused());
    }

    #[test]
    fn transitions_logged_once_each_way() {
        let sink = CaptureSink::shared();
        let handle = ResizeHandle::new(sink.clone());

        handle.set_size(0, 0);
        handle.set_size(0, 10);
        handle.set_size(640, 480);
        handle.set_size(800, 600);

        assert_eq!(sink.count_containing("collapsed"), 1);
        assert_eq!(sink.count_containing("expanded"), 1);
        assert_eq!(sink.messages(LogChannel::Log).len(), 2);
    }

    #[test]
    fn every_publish_is_logged_on_graph() {
        let sink = CaptureSink::shared();
        let handle = ResizeHandle::new(sink.clone());

        handle.set_size(640, 480);
        handle.set_size(640, 480);
        handle.set_size(0, 480);

        let graph = sink.messages(LogChannel::Graph);
        assert_eq!(graph.len(), 3);
        assert!(graph[2].contains("width = 0; height = 480"));
    }

    #[test]
    fn pending_size_is_consumed_once() {
        let handle = ResizeHandle::new(CaptureSink::shared());
        handle.set_size(1024, 768);
        handle.set_size(1280, 720);

        assert_eq!(handle.pending(), Some((1280, 720)));
        assert_eq!(handle.wait_pending(None), Some((1280, 720)));
        assert_eq!(handle.pending(), None);
        assert_eq!(handle.take_pending(), None);
    }

    #[test]
    fn wait_times_out_without_publish() {
        let handle = ResizeHandle::new(CaptureSink::shared());
        assert_eq!(handle.wait_pending(Some(Duration::from_millis(10))), None);
    }

    #[test]
    fn wait_wakes_on_publish_from_another_thread() {
        let handle = ResizeHandle::new(CaptureSink::shared());
        let publisher = handle.clone();

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.set_size(320, 240);
        });

        assert_eq!(
            handle.wait_pending(Some(Duration::from_secs(5))),
            Some((320, 240))
        );
        worker.join().unwrap();
    }
}
