use std::cell::RefCell;
use std::rc::Rc;

/// Events published on the printer bus. Payloads carry identifiers
/// rather than object references; handlers look collaborators up
/// themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum PrinterEvent {
    Connect,
    Shutdown(String),
    RequestRestart,
    SyncPrintTime {
        eventtime: f64,
        est_print_time: f64,
        print_time: f64,
    },
    MotorOff(f64),
    HomingMoveBegin(Vec<String>),
    HomingMoveEnd(Vec<String>),
    HomeRailsBegin(Vec<String>),
    HomeRailsEnd(Vec<String>),
}

type Handler = Box<dyn Fn(&PrinterEvent)>;

/// Minimal publish/subscribe bus shared by the toolhead and the homing
/// sequencer.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Rc<RefCell<Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    pub fn register<F: Fn(&PrinterEvent) + 'static>(&self, handler: F) {
        self.handlers.borrow_mut().push(Box::new(handler));
    }

    pub fn send(&self, event: &PrinterEvent) {
        for handler in self.handlers.borrow().iter() {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn handlers_receive_events() {
        let bus = EventBus::new();
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        bus.register(move |ev| {
            if matches!(ev, PrinterEvent::Shutdown(_)) {
                seen2.set(seen2.get() + 1);
            }
        });
        bus.send(&PrinterEvent::Connect);
        bus.send(&PrinterEvent::Shutdown("test".into()));
        assert_eq!(seen.get(), 1);
    }
}
