use std::cell::Cell;

/// The slice of the MCU transport the scheduler needs: a clock estimate
/// and a flush barrier. The transport itself lives outside this crate.
pub trait Mcu {
    /// Estimated MCU print time corresponding to a host monotonic time.
    fn estimated_print_time(&self, eventtime: f64) -> f64;
    /// All moves up to `print_time` must be transmitted.
    fn flush_moves(&self, print_time: f64);
    /// True when output goes to a file instead of real hardware; stall
    /// checking is disabled in that case.
    fn is_fileoutput(&self) -> bool {
        false
    }
}

/// MCU stand-in whose print-time clock tracks the reactor clock with a
/// fixed offset. Records its flush barrier for inspection.
pub struct SimMcu {
    clock_offset: f64,
    fileoutput: bool,
    last_flush: Cell<f64>,
}

impl SimMcu {
    pub fn new() -> SimMcu {
        SimMcu {
            clock_offset: 0.0,
            fileoutput: false,
            last_flush: Cell::new(0.0),
        }
    }

    pub fn fileoutput() -> SimMcu {
        SimMcu {
            fileoutput: true,
            ..SimMcu::new()
        }
    }

    pub fn last_flush_time(&self) -> f64 {
        self.last_flush.get()
    }
}

impl Default for SimMcu {
    fn default() -> Self {
        SimMcu::new()
    }
}

impl Mcu for SimMcu {
    fn estimated_print_time(&self, eventtime: f64) -> f64 {
        eventtime + self.clock_offset
    }

    fn flush_moves(&self, print_time: f64) {
        if print_time > self.last_flush.get() {
            self.last_flush.set(print_time);
        }
    }

    fn is_fileoutput(&self) -> bool {
        self.fileoutput
    }
}
