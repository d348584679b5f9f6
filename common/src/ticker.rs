use std::time::Duration;

use rand::Rng;

/// A loop interval with ±50% jitter, so replicas of the same component do not
/// sweep in lockstep.
pub fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis().max(2) as u64;
    let low = millis / 2;
    Duration::from_millis(low + rand::thread_rng().gen_range(0..millis))
}

pub async fn sleep_jittered(base: Duration) {
    tokio::time::sleep(jittered(base)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_half_and_one_and_a_half() {
        let base = Duration::from_secs(10);
        for _ in 0..1000 {
            let d = jittered(base);
            assert!(d >= Duration::from_secs(5));
            assert!(d < Duration::from_secs(15));
        }
    }
}
