use crate::errors::GroveError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Cooperative cancellation shared by every task of one pass. The first
/// failure stores its cause and flips the flag; later tasks observe the
/// flag before mapping and short-circuit.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
    cause: Mutex<Option<GroveError>>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn cancel(&self, err: GroveError) {
        if let Ok(mut cause) = self.cause.lock() {
            if cause.is_none() {
                *cause = Some(err);
            }
        }
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn take_cause(&self) -> Option<GroveError> {
        self.cause.lock().ok().and_then(|mut c| c.take())
    }
}

/// A work-stealing-friendly id dispenser: tasks pull the next unclaimed
/// chunk id until the range is drained.
#[derive(Debug)]
pub struct Dispenser {
    next: AtomicUsize,
    limit: usize,
}

impl Dispenser {
    pub fn new(limit: usize) -> Self {
        Dispenser {
            next: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn next(&self) -> Option<usize> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        (id < self.limit).then_some(id)
    }
}

/// A map/reduce function replicated across a local task tree. `map` runs
/// once per task; completed children are folded into their parent with
/// `reduce`, so reductions compose pairwise.
pub trait MrFun: Send + Sized {
    fn map(&mut self, task_id: usize) -> Result<(), GroveError>;
    fn make_copy(&self) -> Self;
    fn reduce(&mut self, other: Self);
}

/// Run `ntasks` copies of `fun` arranged in a binary task tree: a task
/// covering [lo, hi) splits at the midpoint, spawns both halves, maps the
/// midpoint itself and then reduces its completed children into itself.
/// The returned function holds the fully reduced state; the first map
/// error cancels the remaining tasks and is surfaced here.
pub fn local_mr<F: MrFun>(fun: F, ntasks: usize, cancel: &CancelToken) -> Result<F, GroveError> {
    let fun = mr_node(fun, 0, ntasks.max(1), cancel);
    match cancel.take_cause() {
        Some(cause) => Err(cause),
        None => Ok(fun),
    }
}

fn run_map<F: MrFun>(fun: &mut F, task_id: usize, cancel: &CancelToken) {
    if cancel.is_set() {
        return;
    }
    if let Err(e) = fun.map(task_id) {
        cancel.cancel(e);
    }
}

fn mr_node<F: MrFun>(mut fun: F, lo: usize, hi: usize, cancel: &CancelToken) -> F {
    debug_assert!(hi > lo);
    let mid = lo + ((hi - lo) >> 1);
    if hi - lo >= 2 {
        let left = fun.make_copy();
        let right = (mid + 1 < hi).then(|| fun.make_copy());
        let ((l, r), ()) = rayon::join(
            || {
                rayon::join(
                    || mr_node(left, lo, mid, cancel),
                    || right.map(|f| mr_node(f, mid + 1, hi, cancel)),
                )
            },
            || run_map(&mut fun, mid, cancel),
        );
        fun.reduce(l);
        if let Some(r) = r {
            fun.reduce(r);
        }
        fun
    } else {
        run_map(&mut fun, mid, cancel);
        fun
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SumFun {
        seen: Vec<usize>,
        copies: usize,
    }

    impl MrFun for SumFun {
        fn map(&mut self, task_id: usize) -> Result<(), GroveError> {
            self.seen.push(task_id);
            Ok(())
        }
        fn make_copy(&self) -> Self {
            SumFun {
                seen: Vec::new(),
                copies: 1,
            }
        }
        fn reduce(&mut self, other: Self) {
            self.seen.extend(other.seen);
            self.copies += other.copies;
        }
    }

    #[test]
    fn test_every_task_maps_once() {
        for ntasks in [1, 2, 3, 7, 8, 13] {
            let cancel = CancelToken::new();
            let fun = local_mr(SumFun { seen: Vec::new(), copies: 1 }, ntasks, &cancel).unwrap();
            let mut seen = fun.seen.clone();
            seen.sort_unstable();
            assert_eq!(seen, (0..ntasks).collect::<Vec<_>>());
            assert_eq!(fun.copies, ntasks);
        }
    }

    struct FailFun;

    impl MrFun for FailFun {
        fn map(&mut self, task_id: usize) -> Result<(), GroveError> {
            if task_id == 3 {
                return Err(GroveError::Cancelled("task 3 blew up".to_string()));
            }
            Ok(())
        }
        fn make_copy(&self) -> Self {
            FailFun
        }
        fn reduce(&mut self, _other: Self) {}
    }

    #[test]
    fn test_first_error_is_surfaced() {
        let cancel = CancelToken::new();
        let res = local_mr(FailFun, 8, &cancel);
        assert!(matches!(res, Err(GroveError::Cancelled(_))));
    }

    #[test]
    fn test_dispenser_drains_exactly_once() {
        let d = Dispenser::new(5);
        let mut got = Vec::new();
        while let Some(id) = d.next() {
            got.push(id);
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert!(d.next().is_none());
    }
}
