use std::rc::Rc;

/// A function invoked on every reactor iteration.
///
/// `poll` may perform non-blocking work and reports whether it did any;
/// `pure_poll` only checks. Before the reactor blocks it asks every
/// poller to enter interrupt mode (arranging to be woken by the kernel
/// instead of by polling); a refusal aborts the attempt and the pollers
/// already converted are rewound in reverse order.
pub trait PollFn {
    fn poll(&self) -> bool;

    fn pure_poll(&self) -> bool;

    fn try_enter_interrupt_mode(&self) -> bool {
        true
    }

    fn exit_interrupt_mode(&self) {}
}

/// Registered pollers, in registration order. The built-in pollers are
/// registered first, in the fixed order the reactor requires; user
/// pollers follow.
pub(crate) struct PollerRegistry {
    pollers: Vec<Rc<dyn PollFn>>,
}

impl PollerRegistry {
    pub(crate) fn new() -> PollerRegistry {
        PollerRegistry {
            pollers: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, p: Rc<dyn PollFn>) {
        self.pollers.push(p);
    }

    pub(crate) fn unregister(&mut self, p: &Rc<dyn PollFn>) {
        self.pollers.retain(|q| !Rc::ptr_eq(q, p));
    }

    pub(crate) fn poll_all(&self) -> bool {
        let mut work = false;
        for p in &self.pollers {
            work |= p.poll();
        }
        work
    }

    pub(crate) fn pure_poll_all(&self) -> bool {
        self.pollers.iter().any(|p| p.pure_poll())
    }

    /// True if every poller accepted interrupt mode; on refusal the ones
    /// already entered are exited in reverse order and false is returned.
    pub(crate) fn try_enter_interrupt_mode(&self) -> bool {
        for (i, p) in self.pollers.iter().enumerate() {
            if !p.try_enter_interrupt_mode() {
                for q in self.pollers[..i].iter().rev() {
                    q.exit_interrupt_mode();
                }
                return false;
            }
        }
        true
    }

    pub(crate) fn exit_interrupt_mode(&self) {
        for p in self.pollers.iter().rev() {
            p.exit_interrupt_mode();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pollers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    struct Recording {
        name: &'static str,
        work: Cell<bool>,
        accept_interrupt: bool,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl PollFn for Recording {
        fn poll(&self) -> bool {
            self.log.borrow_mut().push(format!("poll:{}", self.name));
            self.work.get()
        }

        fn pure_poll(&self) -> bool {
            self.work.get()
        }

        fn try_enter_interrupt_mode(&self) -> bool {
            self.log.borrow_mut().push(format!("enter:{}", self.name));
            self.accept_interrupt
        }

        fn exit_interrupt_mode(&self) {
            self.log.borrow_mut().push(format!("exit:{}", self.name));
        }
    }

    fn poller(
        name: &'static str,
        accept: bool,
        log: &Rc<RefCell<Vec<String>>>,
    ) -> Rc<Recording> {
        Rc::new(Recording {
            name,
            work: Cell::new(false),
            accept_interrupt: accept,
            log: log.clone(),
        })
    }

    #[test]
    fn polls_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = PollerRegistry::new();
        reg.register(poller("a", true, &log));
        reg.register(poller("b", true, &log));
        reg.register(poller("c", true, &log));

        assert!(!reg.poll_all());
        assert_eq!(*log.borrow(), vec!["poll:a", "poll:b", "poll:c"]);
    }

    #[test]
    fn poll_all_reports_any_work() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = PollerRegistry::new();
        let busy = poller("busy", true, &log);
        busy.work.set(true);
        reg.register(poller("idle", true, &log));
        reg.register(busy);
        assert!(reg.poll_all());
        assert!(reg.pure_poll_all());
    }

    #[test]
    fn interrupt_refusal_rewinds_in_reverse() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = PollerRegistry::new();
        reg.register(poller("a", true, &log));
        reg.register(poller("b", true, &log));
        reg.register(poller("c", false, &log));

        assert!(!reg.try_enter_interrupt_mode());
        assert_eq!(
            *log.borrow(),
            vec!["enter:a", "enter:b", "enter:c", "exit:b", "exit:a"]
        );
    }

    #[test]
    fn exit_runs_in_reverse_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = PollerRegistry::new();
        reg.register(poller("a", true, &log));
        reg.register(poller("b", true, &log));

        assert!(reg.try_enter_interrupt_mode());
        log.borrow_mut().clear();
        reg.exit_interrupt_mode();
        assert_eq!(*log.borrow(), vec!["exit:b", "exit:a"]);
    }

    #[test]
    fn unregister_removes_by_identity() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = PollerRegistry::new();
        let a = poller("a", true, &log);
        let b = poller("b", true, &log);
        reg.register(a.clone());
        reg.register(b.clone());
        let a_dyn: Rc<dyn PollFn> = a;
        reg.unregister(&a_dyn);
        assert_eq!(reg.len(), 1);
        reg.poll_all();
        assert_eq!(*log.borrow(), vec!["poll:b"]);
    }
}
