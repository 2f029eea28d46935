//! Thread affinity for the dispatch loop.

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::error::{Error, Result};

/// Pin the calling thread to a single CPU.
///
/// The dispatch loop benefits from staying on one core: the submission
/// rings it polls and the io_uring completion queue stay warm in that
/// core's cache. Purely an optimization; correctness never depends on it.
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    let available = num_cpus::get();
    if cpu >= available {
        return Err(Error::config(format!(
            "cannot pin to CPU {cpu}; {available} CPUs available"
        )));
    }
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_to_first_cpu() {
        // CPU 0 may be outside the allowed cpuset in containers; only an
        // affinity error is acceptable then.
        match pin_current_thread(0) {
            Ok(()) => {}
            Err(Error::CpuAffinity(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pin_out_of_range() {
        assert!(pin_current_thread(num_cpus::get()).is_err());
    }
}
