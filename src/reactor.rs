use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Timer wake time meaning "never fires".
pub const NEVER: f64 = 9999999999999999.0;
/// Timer wake time meaning "fire on the next dispatch".
pub const NOW: f64 = 0.0;

pub type TimerCallback = Box<dyn FnMut(f64) -> f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(usize);

/// The cooperative event loop the motion core runs on. Everything is
/// single threaded; `pause` is the only suspension point.
pub trait Reactor {
    /// Monotonic time in seconds.
    fn monotonic(&self) -> f64;
    /// Suspend until `waketime`, dispatching due timers. Returns the
    /// time at which control came back.
    fn pause(&self, waketime: f64) -> f64;
    /// Register a timer. The callback receives the dispatch time and
    /// returns its next wake time (`NEVER` to stop).
    fn register_timer(&self, callback: TimerCallback) -> TimerHandle;
    fn update_timer(&self, handle: TimerHandle, waketime: f64);
}

/// Single-threaded completion latch, handed out by the drip path and
/// completed from endstop notifications.
#[derive(Clone, Default)]
pub struct Completion {
    result: Rc<Cell<Option<bool>>>,
}

impl Completion {
    pub fn new() -> Completion {
        Completion::default()
    }

    pub fn complete(&self, result: bool) {
        if self.result.get().is_none() {
            self.result.set(Some(result));
        }
    }

    pub fn test(&self) -> bool {
        self.result.get().is_some()
    }

    pub fn result(&self) -> Option<bool> {
        self.result.get()
    }
}

struct SimTimer {
    waketime: f64,
    callback: Option<TimerCallback>,
}

/// Deterministic reactor: time only advances when someone pauses.
/// Collaborator simulations (endstops, MCU clocks) hang timers off it.
pub struct SimReactor {
    now: Cell<f64>,
    timers: RefCell<Vec<SimTimer>>,
}

impl SimReactor {
    pub fn new() -> SimReactor {
        SimReactor {
            now: Cell::new(0.0),
            timers: RefCell::new(Vec::new()),
        }
    }

    fn next_due(&self, limit: f64) -> Option<(usize, f64)> {
        self.timers
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.callback.is_some() && t.waketime <= limit)
            .min_by(|a, b| a.1.waketime.partial_cmp(&b.1.waketime).unwrap())
            .map(|(i, t)| (i, t.waketime))
    }

    fn dispatch(&self, idx: usize, waketime: f64) {
        // Take the callback out so it may re-enter update_timer.
        let mut callback = {
            let mut timers = self.timers.borrow_mut();
            timers[idx].waketime = NEVER;
            timers[idx].callback.take().unwrap()
        };
        if waketime > self.now.get() {
            self.now.set(waketime);
        }
        let next = callback(self.now.get());
        let mut timers = self.timers.borrow_mut();
        timers[idx].callback = Some(callback);
        if timers[idx].waketime == NEVER {
            timers[idx].waketime = next;
        }
    }
}

impl Default for SimReactor {
    fn default() -> Self {
        SimReactor::new()
    }
}

impl Reactor for SimReactor {
    fn monotonic(&self) -> f64 {
        self.now.get()
    }

    fn pause(&self, waketime: f64) -> f64 {
        while let Some((idx, due)) = self.next_due(waketime) {
            self.dispatch(idx, due);
        }
        if waketime > self.now.get() {
            self.now.set(waketime);
        }
        self.now.get()
    }

    fn register_timer(&self, callback: TimerCallback) -> TimerHandle {
        let mut timers = self.timers.borrow_mut();
        timers.push(SimTimer {
            waketime: NEVER,
            callback: Some(callback),
        });
        TimerHandle(timers.len() - 1)
    }

    fn update_timer(&self, handle: TimerHandle, waketime: f64) {
        let mut timers = self.timers.borrow_mut();
        if let Some(t) = timers.get_mut(handle.0) {
            t.waketime = waketime;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_advances_time() {
        let reactor = SimReactor::new();
        assert_eq!(reactor.monotonic(), 0.0);
        assert_eq!(reactor.pause(1.5), 1.5);
        assert_eq!(reactor.monotonic(), 1.5);
        // Pausing into the past does not rewind the clock.
        assert_eq!(reactor.pause(1.0), 1.5);
    }

    #[test]
    fn timers_fire_in_order() {
        let reactor = SimReactor::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        for (name, at) in [("b", 0.2), ("a", 0.1)].iter() {
            let fired = fired.clone();
            let name = *name;
            let handle = reactor.register_timer(Box::new(move |t| {
                fired.borrow_mut().push((name, t));
                NEVER
            }));
            reactor.update_timer(handle, *at);
        }
        reactor.pause(1.0);
        assert_eq!(*fired.borrow(), vec![("a", 0.1), ("b", 0.2)]);
    }

    #[test]
    fn completion_latches_first_result() {
        let c = Completion::new();
        assert!(!c.test());
        c.complete(true);
        c.complete(false);
        assert_eq!(c.result(), Some(true));
    }
}
