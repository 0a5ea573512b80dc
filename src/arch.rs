//! CPU-context layer of the hosted machine.
//!
//! Every CPU scheduler and every kernel thread runs on its own OS thread, called a strand. A CPU
//! is a baton: exactly one strand holds it at a time and `swtch` hands it to another strand,
//! carrying the hart state (CPU id and interrupt-enable bit) along. A strand that gave the baton
//! away blocks until some CPU hands one back, which is what makes `swtch` look like a register
//! swap to the code above it.

use std::boxed::Box;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::string::{String, ToString};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use std::vec::Vec;

use crate::error::KernelError;

/// A value recorded by a user program through the board's probe port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub tag: &'static str,
    pub value: isize,
}

/// Machine-wide state shared by every hart: halt line, fault log and probe port.
#[derive(Debug, Default)]
pub struct Board {
    halted: Mutex<bool>,
    halt_signal: Condvar,
    halted_fast: AtomicBool,
    faults: Mutex<Vec<String>>,
    probes: Mutex<Vec<Probe>>,
    strands: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Board {
    pub fn new() -> &'static Board {
        Box::leak(Box::default())
    }

    /// Stops the machine. Idle harts park for good.
    pub fn halt(&self) {
        let mut halted = lock(&self.halted);
        *halted = true;
        self.halted_fast.store(true, Ordering::Release);
        self.halt_signal.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.halted_fast.load(Ordering::Acquire)
    }

    /// Records a fatal kernel error and halts.
    pub fn fault(&self, message: String) {
        log::error!("kernel fault: {}", message);
        lock(&self.faults).push(message);
        self.halt();
    }

    pub fn faults(&self) -> Vec<String> {
        lock(&self.faults).clone()
    }

    pub fn probe(&self, tag: &'static str, value: isize) {
        lock(&self.probes).push(Probe { tag, value });
    }

    pub fn probes(&self) -> Vec<Probe> {
        lock(&self.probes).clone()
    }

    /// Kernel-thread strands whose OS thread has not ended yet.
    pub fn live_strands(&self) -> usize {
        self.strands.load(Ordering::Acquire)
    }

    /// Blocks until the machine halts or `timeout` passes. Returns true if halted.
    pub fn wait_halted(&self, timeout: Duration) -> bool {
        let halted = lock(&self.halted);
        let (halted, _) = self
            .halt_signal
            .wait_timeout_while(halted, timeout, |halted| !*halted)
            .unwrap_or_else(PoisonError::into_inner);
        *halted
    }
}

/// The part of a CPU that travels with the baton.
#[derive(Clone, Copy)]
struct Hart {
    id: usize,
    intr: bool,
    board: &'static Board,
}

enum Baton {
    Idle,
    Run(Hart),
    Retire,
}

/// An OS thread standing in for one kernel execution stream.
struct Strand {
    baton: Mutex<Baton>,
    signal: Condvar,
    started: AtomicBool,
}

impl Strand {
    fn new(started: bool) -> Arc<Self> {
        Arc::new(Self {
            baton: Mutex::new(Baton::Idle),
            signal: Condvar::new(),
            started: AtomicBool::new(started),
        })
    }

    fn pass(&self, hart: Hart) {
        *lock(&self.baton) = Baton::Run(hart);
        self.signal.notify_one();
    }

    /// Tells a strand that is not holding a CPU to end.
    fn retire(&self) {
        let mut baton = lock(&self.baton);
        if matches!(*baton, Baton::Idle) {
            *baton = Baton::Retire;
            self.signal.notify_one();
        }
    }

    /// Blocks until handed a CPU. `None` means the strand will never run.
    fn wait(&self) -> Option<Hart> {
        let mut baton = lock(&self.baton);
        loop {
            match core::mem::replace(&mut *baton, Baton::Idle) {
                Baton::Run(hart) => return Some(hart),
                Baton::Retire => return None,
                Baton::Idle => {
                    baton = self
                        .signal
                        .wait(baton)
                        .unwrap_or_else(PoisonError::into_inner)
                }
            }
        }
    }
}

thread_local! {
    static HART: Cell<Option<Hart>> = const { Cell::new(None) };
    static STRAND: RefCell<Option<Arc<Strand>>> = const { RefCell::new(None) };
}

fn hart() -> Hart {
    HART.with(|hart| hart.get())
        .expect("no hart bound to this thread")
}

fn set_hart(hart: Hart) {
    HART.with(|cell| cell.set(Some(hart)));
}

/// Unwind payload that ends a retired strand.
struct Retired;

fn park_forever() -> ! {
    loop {
        std::thread::park();
    }
}

/// Saved kernel execution state of a thread or of a CPU's scheduler.
#[derive(Default)]
pub struct Context {
    strand: Option<Arc<Strand>>,
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("live", &self.strand.is_some())
            .finish()
    }
}

impl Context {
    pub const fn new() -> Self {
        Self { strand: None }
    }

    /// Creates a context that starts executing `entry` the first time it is switched to.
    pub fn spawn(name: String, entry: Box<dyn FnOnce() + Send>) -> Result<Self, KernelError> {
        let board = hart().board;
        let strand = Strand::new(false);
        let handle = strand.clone();

        board.strands.fetch_add(1, Ordering::AcqRel);
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            if let Some(hart) = handle.wait() {
                handle.started.store(true, Ordering::Release);
                STRAND.with(|strand| *strand.borrow_mut() = Some(handle));
                set_hart(hart);
                run_guarded(board, entry);
            }
            board.strands.fetch_sub(1, Ordering::AcqRel);
        });

        match spawned {
            Ok(_) => Ok(Self {
                strand: Some(strand),
            }),
            Err(_) => {
                board.strands.fetch_sub(1, Ordering::AcqRel);
                err!(KernelError::Alloc)
            }
        }
    }

    /// Drops the context and ends its strand.
    ///
    /// The stream must be switched out for good: either it never ran, or it is parked in
    /// `swtch` and nothing will switch back to it.
    pub fn retire(&mut self) {
        if let Some(strand) = self.strand.take() {
            strand.retire();
        }
    }
}

/// Saves the current execution stream in `old` and resumes the one in `new`.
///
/// Returns when some CPU switches back to `old`, possibly a different one. If `old` is retired
/// instead, its stream unwinds and ends without returning, so frames above must not hold guards
/// that were handed off with the CPU.
///
/// # Safety
/// `old` and `new` must be valid. Nothing else may touch `*old` until this stream is resumed.
pub unsafe fn swtch(old: *mut Context, new: *const Context) {
    let me = STRAND
        .with(|strand| strand.borrow().clone())
        .expect("swtch from a thread without a strand");
    let hart = hart();
    let next = unsafe { (*new).strand.clone() }.expect("swtch to an empty context");

    unsafe { (*old).strand = Some(me.clone()) };
    next.pass(hart);

    match me.wait() {
        Some(hart) => set_hart(hart),
        None => panic::resume_unwind(Box::new(Retired)),
    }
}

/// Binds the calling OS thread to CPU `id`, interrupts off.
pub fn bind(id: usize, board: &'static Board) {
    set_hart(Hart {
        id,
        intr: false,
        board,
    });
    STRAND.with(|strand| *strand.borrow_mut() = Some(Strand::new(true)));
}

/// Binds the calling OS thread to CPU `id` and runs `body` on it, recording any panic as a
/// machine fault.
pub fn run_cpu(id: usize, board: &'static Board, body: impl FnOnce()) {
    bind(id, board);
    run_guarded(board, body);
}

fn run_guarded(board: &'static Board, body: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
        if payload.is::<Retired>() {
            return;
        }
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("unknown panic")
        };
        board.fault(message);
    }
}

/// Id of the CPU the calling stream runs on.
pub fn cpu_id() -> usize {
    hart().id
}

pub fn try_cpu_id() -> Option<usize> {
    HART.with(|hart| hart.get()).map(|hart| hart.id)
}

pub fn board() -> &'static Board {
    hart().board
}

pub fn intr_get() -> bool {
    hart().intr
}

pub fn intr_on() {
    set_hart(Hart {
        intr: true,
        ..hart()
    });
}

pub fn intr_off() {
    set_hart(Hart {
        intr: false,
        ..hart()
    });
}

/// Waits for the next interrupt. A halted machine never delivers one.
pub fn wait_for_interrupt() {
    if hart().board.is_halted() {
        park_forever();
    }
    std::thread::sleep(Duration::from_micros(50));
}

/// Busy-wait hint for lock loops.
pub fn spin_hint() {
    if let Some(hart) = HART.with(|hart| hart.get()) {
        if hart.board.is_halted() {
            park_forever();
        }
    }
    core::hint::spin_loop();
}
