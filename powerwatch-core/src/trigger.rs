//! Windowed edge detector with hysteresis.
//!
//! A [`HysteresisTrigger`] keeps the last `size` readings together with
//! whether its predicate held for each. It fires when a reading that did
//! *not* hold is followed by `size` readings that all hold, i.e. the
//! condition was entered and then stayed entered for the whole window.
//!
//! ```text
//! size = 3, predicate = value > 10
//!
//!   add  9 -> [ 9 ]                  window too short
//!   add 11 -> [ 9, 11 ]              window too short
//!   add 12 -> [ 9, 11, 12 ]          window too short
//!   add 13 -> [ 9, 11, 12, 13 ]      head fails, tail holds -> fire
//!          -> [ 11, 12, 13 ]         truncated
//!   add 14 -> [ 11, 12, 13, 14 ]     head holds -> no fire
//! ```

use std::collections::VecDeque;
use std::num::NonZeroUsize;

pub struct HysteresisTrigger<P, A> {
    size: NonZeroUsize,
    window: VecDeque<(f64, bool)>,
    predicate: P,
    action: A,
}

impl<P, A> HysteresisTrigger<P, A>
where
    P: Fn(f64) -> bool,
    A: FnMut(Vec<f64>),
{
    pub fn new(size: NonZeroUsize, predicate: P, action: A) -> Self {
        Self {
            size,
            window: VecDeque::with_capacity(size.get() + 1),
            predicate,
            action,
        }
    }

    /// Records `value`; returns `true` when the action was invoked.
    pub fn add(&mut self, value: f64) -> bool {
        let holds = (self.predicate)(value);
        self.window.push_back((value, holds));

        let fired = self.crossed();
        if fired {
            let values: Vec<f64> = self.values().collect();
            (self.action)(values);
        }

        while self.window.len() > self.size.get() {
            self.window.pop_front();
        }
        fired
    }

    /// Readings currently in the window, oldest first.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.window.iter().map(|(value, _)| *value)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn size(&self) -> NonZeroUsize {
        self.size
    }

    // Evaluated before truncation, so a fire sees size + 1 entries.
    fn crossed(&self) -> bool {
        let mut entries = self.window.iter();
        let Some((_, head_holds)) = entries.next() else {
            return false;
        };

        self.window.len() > self.size.get() && !head_holds && entries.all(|(_, holds)| *holds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    /// Trigger that records every payload it fires with.
    fn recording(
        n: usize,
        predicate: impl Fn(f64) -> bool,
    ) -> (
        HysteresisTrigger<impl Fn(f64) -> bool, impl FnMut(Vec<f64>)>,
        Rc<RefCell<Vec<Vec<f64>>>>,
    ) {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&fired);
        let trigger = HysteresisTrigger::new(size(n), predicate, move |values| {
            sink.borrow_mut().push(values)
        });
        (trigger, fired)
    }

    fn feed<P, A>(trigger: &mut HysteresisTrigger<P, A>, values: &[f64])
    where
        P: Fn(f64) -> bool,
        A: FnMut(Vec<f64>),
    {
        for value in values {
            trigger.add(*value);
        }
    }

    #[test]
    fn fires_when_falling_below_threshold_for_whole_window() {
        let (mut trigger, fired) = recording(3, |v| v < 10.0);
        feed(&mut trigger, &[10.0, 9.0, 9.0, 9.0]);
        assert_eq!(*fired.borrow(), vec![vec![10.0, 9.0, 9.0, 9.0]]);
    }

    #[test]
    fn does_not_fire_when_crossed_back_before_window_filled() {
        let (mut trigger, fired) = recording(3, |v| v < 10.0);
        feed(&mut trigger, &[10.0, 9.0, 9.0, 10.0]);
        assert!(fired.borrow().is_empty());
    }

    #[test]
    fn does_not_fire_when_condition_always_held() {
        let (mut trigger, fired) = recording(3, |v| v < 10.0);
        feed(&mut trigger, &[9.0, 9.0, 9.0, 9.0]);
        assert!(fired.borrow().is_empty());
    }

    #[test]
    fn does_not_fire_when_condition_never_held() {
        let (mut trigger, fired) = recording(2, |v| v > 100.0);
        feed(&mut trigger, &[1.0, 5.0, 3.0, 80.0, 99.9, 100.0]);
        assert!(fired.borrow().is_empty());
    }

    #[test]
    fn start_detector_scenarios() {
        let (mut trigger, fired) = recording(3, |v| v > 10.0);
        feed(&mut trigger, &[10.0, 9.0, 9.0, 9.0]);
        assert!(fired.borrow().is_empty());

        let (mut trigger, fired) = recording(3, |v| v > 10.0);
        feed(&mut trigger, &[9.0, 11.0, 12.0, 13.0]);
        assert_eq!(*fired.borrow(), vec![vec![9.0, 11.0, 12.0, 13.0]]);

        let (mut trigger, fired) = recording(3, |v| v > 10.0);
        feed(&mut trigger, &[11.0, 12.0, 9.0, 13.0]);
        assert!(fired.borrow().is_empty());
    }

    #[test]
    fn never_fires_before_window_overflows() {
        let (mut trigger, fired) = recording(4, |v| v > 10.0);
        assert!(!trigger.add(1.0));
        assert!(!trigger.add(20.0));
        assert!(!trigger.add(20.0));
        assert!(!trigger.add(20.0));
        assert!(fired.borrow().is_empty());
        assert!(trigger.add(20.0));
    }

    #[test]
    fn window_is_truncated_and_does_not_refire() {
        let (mut trigger, fired) = recording(3, |v| v > 10.0);
        feed(&mut trigger, &[9.0, 11.0, 12.0, 13.0]);
        assert_eq!(trigger.len(), 3);
        assert_eq!(trigger.values().collect::<Vec<_>>(), vec![11.0, 12.0, 13.0]);

        assert!(!trigger.add(14.0));
        assert!(!trigger.add(15.0));
        assert_eq!(fired.borrow().len(), 1);
    }

    #[test]
    fn fires_again_after_fresh_departure() {
        let (mut trigger, fired) = recording(2, |v| v > 10.0);
        feed(&mut trigger, &[0.0, 20.0, 20.0, 20.0, 0.0, 20.0, 20.0]);
        assert_eq!(
            *fired.borrow(),
            vec![vec![0.0, 20.0, 20.0], vec![0.0, 20.0, 20.0]]
        );
    }

    #[test]
    fn single_noisy_sample_resets_eligibility() {
        let (mut trigger, fired) = recording(3, |v| v > 10.0);
        feed(&mut trigger, &[0.0, 50.0, 0.0, 50.0, 50.0]);
        assert!(fired.borrow().is_empty());
        trigger.add(50.0);
        assert_eq!(*fired.borrow(), vec![vec![0.0, 50.0, 50.0, 50.0]]);
    }

    #[test]
    fn any_window_size_fires_once_with_full_payload() {
        for n in 1..=8 {
            let (mut trigger, fired) = recording(n, |v| v > 0.5);
            let mut input = vec![0.0];
            input.extend((1..=n).map(|i| i as f64));
            feed(&mut trigger, &input);
            assert_eq!(*fired.borrow(), vec![input.clone()], "window size {n}");
            assert_eq!(trigger.len(), n);
        }
    }
}
