use std::time::Duration;

use tokio::time::Instant;

/// One-shot deadline polled by the reactor. Dropping the timer disarms it.
#[derive(Clone, Copy, Debug)]
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    pub fn after(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_only_after_its_duration() {
        let timer = Timer::after(Duration::from_millis(500));
        assert!(!timer.is_expired());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(timer.is_expired());
    }
}
