//! [`PowerStateToken`] – one per device node that registered a power
//! listener.
//!
//! | Mode | Driven by |
//! |---|---|
//! | [`PowerMode::SystemControlled`] | [`PowerStateToken::power_state_change`] |
//! | [`PowerMode::DynamicControlled`] | wake-lock acquire / release |
//!
//! In dynamic mode the first acquire resumes the device and the last release
//! suspends it.  The state machine is `Idle → Active ⇄ Inactive`.
//!
//! The wake count only changes while the state lock is held, and the
//! listener runs under that lock too.  A resume therefore always sees a
//! non-zero count and a suspend always sees zero.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hdf_types::{DevId, HdfResult, PowerEvent, PowerMode, PowerTokenState};
use tracing::{debug, warn};

/// Driver-side power callbacks.  Every method defaults to `Ok(())`.
pub trait PowerStateListener: Send + Sync {
    fn suspend(&self, _dev_id: DevId) -> HdfResult<()> {
        Ok(())
    }

    fn resume(&self, _dev_id: DevId) -> HdfResult<()> {
        Ok(())
    }

    fn doze_suspend(&self, _dev_id: DevId) -> HdfResult<()> {
        Ok(())
    }

    fn doze_resume(&self, _dev_id: DevId) -> HdfResult<()> {
        Ok(())
    }
}

/// Wake-lock counter and power event router for one device node.
pub struct PowerStateToken {
    dev_id: DevId,
    listener: Option<Arc<dyn PowerStateListener>>,
    mode: Mutex<PowerMode>,
    wake_ref: AtomicU32,
    state: Mutex<PowerTokenState>,
}

impl PowerStateToken {
    /// Token in [`PowerMode::SystemControlled`] mode, state `Idle`.
    pub fn new(dev_id: DevId, listener: Arc<dyn PowerStateListener>) -> Self {
        Self {
            dev_id,
            listener: Some(listener),
            mode: Mutex::new(PowerMode::default()),
            wake_ref: AtomicU32::new(0),
            state: Mutex::new(PowerTokenState::Idle),
        }
    }

    /// Token without a listener.  Transitions still update the state.
    pub fn detached(dev_id: DevId) -> Self {
        Self {
            dev_id,
            listener: None,
            mode: Mutex::new(PowerMode::default()),
            wake_ref: AtomicU32::new(0),
            state: Mutex::new(PowerTokenState::Idle),
        }
    }

    pub fn dev_id(&self) -> DevId {
        self.dev_id
    }

    pub fn mode(&self) -> PowerMode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mode(&self, mode: PowerMode) {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
        debug!(dev_id = %self.dev_id, ?mode, "power mode changed");
    }

    pub fn state(&self) -> PowerTokenState {
        *self.lock_state()
    }

    pub fn wake_ref_count(&self) -> u32 {
        self.wake_ref.load(Ordering::Acquire)
    }

    /// Take a wake lock.  The `0 → 1` transition resumes the device.
    ///
    /// No-op unless the token is in [`PowerMode::DynamicControlled`].
    pub fn acquire_wake_lock(&self) {
        if self.mode() != PowerMode::DynamicControlled {
            return;
        }
        let mut state = self.lock_state();
        let held = self.wake_ref.load(Ordering::Acquire);
        self.wake_ref.store(held.saturating_add(1), Ordering::Release);
        if held == 0 {
            self.on_first_acquire(&mut state);
        }
    }

    /// Drop a wake lock.  The `1 → 0` transition suspends the device.
    ///
    /// Releasing with no lock held never underflows; it re-runs the
    /// last-release transition instead.
    pub fn release_wake_lock(&self) {
        if self.mode() != PowerMode::DynamicControlled {
            return;
        }
        let mut state = self.lock_state();
        let held = self.wake_ref.load(Ordering::Acquire);
        self.wake_ref.store(held.saturating_sub(1), Ordering::Release);
        if held <= 1 {
            self.on_last_release(&mut state);
        }
    }

    /// Route a system power event to exactly one listener callback.
    ///
    /// No-op unless the token is in [`PowerMode::SystemControlled`].
    pub fn power_state_change(&self, event: PowerEvent) -> HdfResult<()> {
        if self.mode() != PowerMode::SystemControlled {
            return Ok(());
        }
        let Some(listener) = self.listener.as_ref() else {
            return Ok(());
        };
        match event {
            PowerEvent::Suspend => listener.suspend(self.dev_id),
            PowerEvent::Resume => listener.resume(self.dev_id),
            PowerEvent::DozeSuspend => listener.doze_suspend(self.dev_id),
            PowerEvent::DozeResume => listener.doze_resume(self.dev_id),
        }
    }

    fn on_first_acquire(&self, state: &mut PowerTokenState) {
        if *state == PowerTokenState::Active {
            return;
        }
        if let Some(listener) = self.listener.as_ref() {
            if let Err(e) = listener.resume(self.dev_id) {
                warn!(dev_id = %self.dev_id, error = %e, "resume on wake lock failed");
            }
        }
        *state = PowerTokenState::Active;
        debug!(dev_id = %self.dev_id, "power token active");
    }

    fn on_last_release(&self, state: &mut PowerTokenState) {
        if *state == PowerTokenState::Inactive {
            return;
        }
        if let Some(listener) = self.listener.as_ref() {
            if let Err(e) = listener.suspend(self.dev_id) {
                warn!(dev_id = %self.dev_id, error = %e, "suspend on wake unlock failed");
            }
        }
        *state = PowerTokenState::Inactive;
        debug!(dev_id = %self.dev_id, "power token inactive");
    }

    fn lock_state(&self) -> MutexGuard<'_, PowerTokenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for PowerStateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerStateToken")
            .field("dev_id", &self.dev_id)
            .field("mode", &self.mode())
            .field("state", &self.state())
            .field("wake_ref", &self.wake_ref_count())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdf_types::HdfError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak};
    use std::thread;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct CountingListener {
        suspends: AtomicUsize,
        resumes: AtomicUsize,
        doze_suspends: AtomicUsize,
        doze_resumes: AtomicUsize,
    }

    impl PowerStateListener for CountingListener {
        fn suspend(&self, _dev_id: DevId) -> HdfResult<()> {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn resume(&self, _dev_id: DevId) -> HdfResult<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn doze_suspend(&self, _dev_id: DevId) -> HdfResult<()> {
            self.doze_suspends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn doze_resume(&self, _dev_id: DevId) -> HdfResult<()> {
            self.doze_resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RefusingListener;

    impl PowerStateListener for RefusingListener {
        fn suspend(&self, dev_id: DevId) -> HdfResult<()> {
            Err(HdfError::DeviceBusy(dev_id))
        }
    }

    /// Checks the wake count of its own token on every callback.
    #[derive(Default)]
    struct CountCheckingListener {
        token: OnceLock<Weak<PowerStateToken>>,
        violations: AtomicUsize,
        transitions: AtomicUsize,
    }

    impl CountCheckingListener {
        fn check(&self, expect_held: bool) {
            self.transitions.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = self.token.get().and_then(Weak::upgrade) {
                if (token.wake_ref_count() > 0) != expect_held {
                    self.violations.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    impl PowerStateListener for CountCheckingListener {
        fn suspend(&self, _dev_id: DevId) -> HdfResult<()> {
            self.check(false);
            Ok(())
        }
        fn resume(&self, _dev_id: DevId) -> HdfResult<()> {
            self.check(true);
            Ok(())
        }
    }

    fn dynamic_token() -> (Arc<CountingListener>, PowerStateToken) {
        let listener = Arc::new(CountingListener::default());
        let token = PowerStateToken::new(DevId::new(0, 1, 1), listener.clone());
        token.set_mode(PowerMode::DynamicControlled);
        (listener, token)
    }

    #[test]
    fn new_token_is_idle_and_system_controlled() {
        let token = PowerStateToken::detached(DevId::new(0, 1, 1));
        assert_eq!(token.state(), PowerTokenState::Idle);
        assert_eq!(token.mode(), PowerMode::SystemControlled);
        assert_eq!(token.wake_ref_count(), 0);
    }

    #[test]
    fn first_acquire_resumes_last_release_suspends() {
        let (listener, token) = dynamic_token();

        token.acquire_wake_lock();
        token.acquire_wake_lock();
        assert_eq!(listener.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(token.state(), PowerTokenState::Active);

        token.release_wake_lock();
        assert_eq!(listener.suspends.load(Ordering::SeqCst), 0);
        token.release_wake_lock();
        assert_eq!(listener.suspends.load(Ordering::SeqCst), 1);
        assert_eq!(token.state(), PowerTokenState::Inactive);
        assert_eq!(token.wake_ref_count(), 0);
    }

    #[test]
    fn release_at_zero_never_underflows() {
        let (listener, token) = dynamic_token();
        token.release_wake_lock();
        assert_eq!(token.wake_ref_count(), 0);
        assert_eq!(token.state(), PowerTokenState::Inactive);
        // Already inactive: the suspend callback is not repeated.
        token.release_wake_lock();
        assert_eq!(listener.suspends.load(Ordering::SeqCst), 1);
        assert_eq!(token.wake_ref_count(), 0);
    }

    #[test]
    fn wake_lock_ignored_in_system_mode() {
        let listener = Arc::new(CountingListener::default());
        let token = PowerStateToken::new(DevId::new(0, 1, 1), listener.clone());
        token.acquire_wake_lock();
        token.release_wake_lock();
        assert_eq!(token.wake_ref_count(), 0);
        assert_eq!(token.state(), PowerTokenState::Idle);
        assert_eq!(listener.resumes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn power_state_change_dispatches_one_callback() {
        let listener = Arc::new(CountingListener::default());
        let token = PowerStateToken::new(DevId::new(0, 1, 1), listener.clone());

        token.power_state_change(PowerEvent::Suspend).unwrap();
        token.power_state_change(PowerEvent::DozeResume).unwrap();
        token.power_state_change(PowerEvent::DozeResume).unwrap();

        assert_eq!(listener.suspends.load(Ordering::SeqCst), 1);
        assert_eq!(listener.resumes.load(Ordering::SeqCst), 0);
        assert_eq!(listener.doze_suspends.load(Ordering::SeqCst), 0);
        assert_eq!(listener.doze_resumes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn power_state_change_ignored_in_dynamic_mode() {
        let (listener, token) = dynamic_token();
        token.power_state_change(PowerEvent::Resume).unwrap();
        assert_eq!(listener.resumes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn power_state_change_surfaces_listener_error() {
        let token = PowerStateToken::new(DevId::new(0, 2, 1), Arc::new(RefusingListener));
        let err = token.power_state_change(PowerEvent::Suspend).unwrap_err();
        assert!(matches!(err, HdfError::DeviceBusy(_)));
        assert!(token.power_state_change(PowerEvent::Resume).is_ok());
    }

    #[test]
    fn detached_token_accepts_events() {
        let token = PowerStateToken::detached(DevId::new(0, 3, 1));
        assert!(token.power_state_change(PowerEvent::Suspend).is_ok());
        token.set_mode(PowerMode::DynamicControlled);
        token.acquire_wake_lock();
        assert_eq!(token.state(), PowerTokenState::Active);
    }

    #[test]
    fn concurrent_balanced_locks_return_to_zero() {
        let (listener, token) = dynamic_token();
        let token = Arc::new(token);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let token = Arc::clone(&token);
                thread::spawn(move || {
                    for _ in 0..100 {
                        token.acquire_wake_lock();
                        token.release_wake_lock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(token.wake_ref_count(), 0);
        assert_eq!(token.state(), PowerTokenState::Inactive);
        assert!(listener.resumes.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn transitions_agree_with_the_wake_count_under_contention() {
        let listener = Arc::new(CountCheckingListener::default());
        let token = Arc::new(PowerStateToken::new(DevId::new(0, 4, 1), listener.clone()));
        token.set_mode(PowerMode::DynamicControlled);
        assert!(listener.token.set(Arc::downgrade(&token)).is_ok());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let token = Arc::clone(&token);
                thread::spawn(move || {
                    for _ in 0..200 {
                        token.acquire_wake_lock();
                        token.release_wake_lock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(listener.violations.load(Ordering::SeqCst), 0);
        assert!(listener.transitions.load(Ordering::SeqCst) >= 2);
        assert_eq!(token.wake_ref_count(), 0);
        assert_eq!(token.state(), PowerTokenState::Inactive);
    }
}
