use anyhow::{anyhow, Result};

const MAX_PTHREAD_NAME_LEN: usize = 16;

// Linux uses pthread_setname_np(pthread_t, *const c_char).
// It's limited to 16 bytes, including the null terminator.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), MAX_PTHREAD_NAME_LEN - 1);

    // The buffer is zero-initialized, so it stays null-terminated as long
    // as we only write the first `MAX_PTHREAD_NAME_LEN - 1` bytes.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for (dst, src) in c_name_buf.iter_mut().zip(&bytes[..len_to_copy]) {
        *dst = *src as libc::c_char;
    }

    unsafe {
        let thread = libc::pthread_self();
        libc::pthread_setname_np(thread, c_name_buf.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_name(_name: &str) {}

/// Pins the calling thread to one CPU.
#[cfg(target_os = "linux")]
pub(crate) fn pin_this_thread(cpu_id: usize) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id, &mut set);
        let r = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if r != 0 {
            return Err(anyhow!(
                "sched_setaffinity({cpu_id}) failed: {}",
                std::io::Error::last_os_error()
            ));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn pin_this_thread(_cpu_id: usize) -> Result<()> {
    Ok(())
}

/// Number of CPUs the process may run on; used as the default shard count.
pub(crate) fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_name_is_truncated_to_pthread_limit() {
        // Must not crash or overflow; the kernel silently keeps 15 chars.
        set_current_thread_name("a-very-long-thread-name-that-exceeds-the-limit");
    }

    #[test]
    fn at_least_one_cpu() {
        assert!(available_cpus() >= 1);
    }
}
