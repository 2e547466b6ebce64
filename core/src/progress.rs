use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// Snapshot of a long-running operation's state. Reads and compound updates
/// both go through the owning [`Progress`] lock so observers always see a
/// coherent view.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub total: u64,
    pub finished: u64,
    /// 0..=99 while in flight; 100 only on terminal success.
    pub percent: u32,
    pub status_message: String,
    pub can_cancel: bool,
    pub cancel: bool,
    pub complete: bool,
    pub error: bool,
}

/// Shared cancellation/reporting channel between an operation and whatever
/// renders it. Operations poll `is_cancelled` at coarse boundaries only.
#[derive(Debug, Default)]
pub struct Progress {
    state: Mutex<ProgressState>,
    error_confirmed: Condvar,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        let prog = Progress::default();
        {
            let mut st = prog.state.lock().unwrap();
            st.total = total;
            st.can_cancel = true;
            st.status_message = "Time remaining: ?? hours ?? minutes".to_string();
        }
        prog
    }

    pub fn snapshot(&self) -> ProgressState {
        self.state.lock().unwrap().clone()
    }

    pub fn set_status(&self, message: &str) {
        let mut st = self.state.lock().unwrap();
        st.status_message = message.to_string();
        log::debug!("{}", message);
    }

    pub fn set_can_cancel(&self, can_cancel: bool) {
        self.state.lock().unwrap().can_cancel = can_cancel;
    }

    pub fn set_total(&self, total: u64) {
        self.state.lock().unwrap().total = total;
    }

    /// Record progress out of the state's `total`, updating the percentage.
    /// The percentage saturates at 99; only `finish` reports 100.
    pub fn update_finished(&self, finished: u64) {
        let mut st = self.state.lock().unwrap();
        st.finished = finished;
        if st.total > 0 {
            st.percent = (((finished * 100) / st.total) as u32).min(99);
        }
    }

    /// Progress against a weighted multi-phase scale: percentages of all
    /// phases before `phase_base` are done, plus `current/total` of the
    /// current phase's weight.
    pub fn update_weighted(&self, phase_base: u32, weight: u32, current: u64, total: u64) {
        let mut st = self.state.lock().unwrap();
        let mut percent = phase_base as u64;
        if total > 0 {
            percent += (current * weight as u64) / total;
        }
        st.percent = (percent as u32).min(99);
        st.finished = st.percent as u64;
    }

    pub fn update_with_eta(&self, finished: u64, started: Instant, chunk: u64) {
        let mut st = self.state.lock().unwrap();
        st.finished = finished;
        if st.total > 0 {
            st.percent = (((finished * 100) / st.total) as u32).min(99);
        }
        if chunk > 0 && finished >= chunk {
            let remaining = st.total.saturating_sub(finished);
            let elapsed = started.elapsed().as_secs();
            let remaining_secs = (elapsed * (remaining / chunk)) / (finished / chunk).max(1);
            st.status_message = format_eta(remaining_secs);
        }
    }

    pub fn request_cancel(&self) {
        self.state.lock().unwrap().cancel = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancel
    }

    pub fn finish(&self) {
        let mut st = self.state.lock().unwrap();
        st.finished = st.total;
        st.percent = 100;
        st.complete = true;
    }

    pub fn complete_only(&self) {
        self.state.lock().unwrap().complete = true;
    }

    /// Latch an error message and block until a reader confirms it. When
    /// nothing renders this progress, the latch is released immediately.
    pub fn error(&self, message: &str, wait_for_confirm: bool) {
        log::error!("{}", message);
        let mut st = self.state.lock().unwrap();
        st.status_message = message.to_string();
        st.error = true;
        if wait_for_confirm {
            while st.error {
                st = self.error_confirmed.wait(st).unwrap();
            }
        } else {
            st.error = false;
        }
    }

    pub fn confirm_error(&self) {
        let mut st = self.state.lock().unwrap();
        st.error = false;
        self.error_confirmed.notify_all();
    }
}

/// Render remaining seconds as the coarse hours/minutes string operations
/// show while copying.
pub fn format_eta(seconds: u64) -> String {
    let mut out = String::from("Time remaining: ");
    if seconds >= 7200 {
        out.push_str(&format!("{} hours ", seconds / 3600));
    } else if seconds > 3600 {
        out.push_str("1 hour ");
    }
    if seconds >= 60 {
        out.push_str(&format!("{} minutes", (seconds % 3600) / 60));
    } else if seconds < 3600 {
        out.push_str("less than 1 minute");
    }
    out
}
