use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::waitqueue::MultiWakerRegistration;

use crate::{Error, OptionalMode};

const WAITERS: usize = 4;

/// The one operation allowed to talk to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
  Idle,
  Probing,
  Normal,
  WatchdogRecovery,
  EarlySuspend,
  Suspended,
  Resuming,
  LateResume,
  ModeSwitch,
  Calibrating,
  Upgrading,
  CaptureRaw,
  Removing,
}

impl SessionState {
  /// States that stay held between operations instead of ending with one.
  pub const fn is_persistent(self) -> bool {
    matches!(self, SessionState::Probing | SessionState::EarlySuspend | SessionState::Suspended | SessionState::Removing)
  }

  /// Whether `next` may directly follow `self` without passing through Idle.
  const fn admits(self, next: SessionState) -> bool {
    use SessionState::*;
    match next {
      Resuming => matches!(self, Suspended),
      LateResume => matches!(self, EarlySuspend | Resuming),
      Suspended => matches!(self, EarlySuspend),
      _ => false,
    }
  }
}

struct Inner {
  state: SessionState,
  irq_enabled: bool,
  watchdog_enabled: bool,
  optional: OptionalMode,
  waiters: MultiWakerRegistration<WAITERS>,
}

/// Single work-state gate shared by interrupt, watchdog and caller contexts.
///
/// The arbiter starts out in [`SessionState::Probing`]. Interrupt and
/// watchdog paths use [`Arbiter::try_enter`] and skip their work when it
/// fails; callers that must run eventually use [`Arbiter::enter`].
pub struct Arbiter<M: RawMutex> {
  inner: Mutex<M, RefCell<Inner>>,
}

impl<M: RawMutex> Arbiter<M> {
  pub const fn new() -> Self {
    Self {
      inner: Mutex::new(RefCell::new(Inner {
        state: SessionState::Probing,
        irq_enabled: false,
        watchdog_enabled: false,
        optional: OptionalMode::new(),
        waiters: MultiWakerRegistration::new(),
      })),
    }
  }

  pub fn state(&self) -> SessionState {
    self.inner.lock(|inner| inner.borrow().state)
  }

  /// Compare-and-set into `next`. Fails when another session is held.
  pub fn try_enter(&self, next: SessionState) -> Option<SessionGuard<'_, M>> {
    let entered = self.inner.lock(|inner| {
      let mut inner = inner.borrow_mut();
      if inner.state == SessionState::Idle || inner.state.admits(next) {
        inner.state = next;
        true
      } else {
        false
      }
    });
    // The guard exits on drop, so it must only exist once the state is ours.
    entered.then(|| SessionGuard { arbiter: self })
  }

  /// Wait until a transient session ends, then enter `next`.
  ///
  /// A persistent state that does not admit `next` fails right away, since
  /// nothing would ever release it on its own.
  pub async fn enter<E>(&self, next: SessionState) -> Result<SessionGuard<'_, M>, Error<E>> {
    poll_fn(|cx| {
      self.inner.lock(|inner| {
        let mut inner = inner.borrow_mut();
        let state = inner.state;
        if state == SessionState::Idle || state.admits(next) {
          inner.state = next;
          Poll::Ready(Ok(()))
        } else if state.is_persistent() {
          Poll::Ready(Err(Error::InvalidTransition(state)))
        } else {
          inner.waiters.register(cx.waker());
          Poll::Pending
        }
      })
    })
    .await?;
    Ok(SessionGuard { arbiter: self })
  }

  /// Hand the device over after a successful probe.
  pub fn release_probe(&self) {
    self.transition(|state| (state == SessionState::Probing).then_some(SessionState::Idle));
  }

  /// End the held session and wake anyone waiting in [`Arbiter::enter`].
  pub fn exit(&self) {
    self.transition(|_| Some(SessionState::Idle));
  }

  /// Whether an interrupt would be serviced right now.
  pub fn accepts_interrupt(&self) -> bool {
    self.inner.lock(|inner| {
      let inner = inner.borrow();
      inner.irq_enabled && inner.state == SessionState::Idle
    })
  }

  pub fn irq_enabled(&self) -> bool {
    self.inner.lock(|inner| inner.borrow().irq_enabled)
  }

  pub fn set_irq_enabled(&self, enabled: bool) {
    self.inner.lock(|inner| inner.borrow_mut().irq_enabled = enabled);
  }

  pub fn watchdog_enabled(&self) -> bool {
    self.inner.lock(|inner| inner.borrow().watchdog_enabled)
  }

  pub fn set_watchdog_enabled(&self, enabled: bool) {
    self.inner.lock(|inner| inner.borrow_mut().watchdog_enabled = enabled);
  }

  /// Host flags waiting to be mirrored into the optional-mode register.
  pub fn optional_mode(&self) -> OptionalMode {
    self.inner.lock(|inner| inner.borrow().optional)
  }

  pub fn update_optional_mode(&self, f: impl FnOnce(OptionalMode) -> OptionalMode) {
    self.inner.lock(|inner| {
      let mut inner = inner.borrow_mut();
      inner.optional = f(inner.optional);
    });
  }

  fn transition(&self, f: impl FnOnce(SessionState) -> Option<SessionState>) {
    self.inner.lock(|inner| {
      let mut inner = inner.borrow_mut();
      if let Some(next) = f(inner.state) {
        inner.state = next;
        inner.waiters.wake();
      }
    });
  }
}

impl<M: RawMutex> Default for Arbiter<M> {
  fn default() -> Self {
    Self::new()
  }
}

/// Proof of holding the arbiter. Dropping it returns the arbiter to Idle.
pub struct SessionGuard<'a, M: RawMutex> {
  arbiter: &'a Arbiter<M>,
}

impl<M: RawMutex> SessionGuard<'_, M> {
  pub fn state(&self) -> SessionState {
    self.arbiter.state()
  }

  /// Leave the arbiter in a persistent `state` instead of Idle.
  pub fn hold(self, state: SessionState) {
    self.arbiter.transition(|_| Some(state));
    core::mem::forget(self);
  }
}

impl<M: RawMutex> Drop for SessionGuard<'_, M> {
  fn drop(&mut self) {
    self.arbiter.exit();
  }
}
