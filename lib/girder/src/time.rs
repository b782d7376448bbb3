use std::time::SystemTime;

/// Seconds elapsed since the unix epoch. The servers stamp their boot and
/// shutdown statistics with this.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock set before the epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_do_not_run_backwards() {
        let first = timestamp_secs();
        let second = timestamp_secs();

        assert!(first > 0);
        assert!(second >= first);
    }
}
