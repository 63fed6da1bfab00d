//! Best-effort real-time scheduling for the engine threads.

use tracing::{info, warn};

/// FIFO priority requested for the engine threads.
pub const RT_PRIORITY: i32 = 1;

/// Ask for `SCHED_FIFO` on the calling thread. Failure is logged and the
/// thread keeps running at default priority.
#[cfg(unix)]
pub fn elevate(thread: &str) -> bool {
    // SAFETY: sched_param is plain data, and pthread_self always names the
    // calling thread.
    let rc = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = RT_PRIORITY;
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if rc == 0 {
        info!(thread, priority = RT_PRIORITY, "real-time priority");
        true
    } else {
        warn!(
            thread,
            "could not set real-time priority: {}",
            std::io::Error::from_raw_os_error(rc)
        );
        false
    }
}

#[cfg(not(unix))]
pub fn elevate(thread: &str) -> bool {
    warn!(thread, "real-time priority not supported on this platform");
    false
}
