// Copyright 2024 Zinc Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative cancellation, shared between `main` and the Generator/Processor
/// loops. `trigger` is called once, from the signal handler; `is_triggered`
/// and `cancelled` are polled/awaited from inside the loops and the delivery
/// subroutine so in-flight work stops **before** writing to the database
/// rather than being torn down mid-write by a `JoinHandle::abort`.
#[derive(Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Sets the flag and wakes every waiter. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Resolves immediately if already triggered, otherwise waits for
    /// `trigger`. Meant to be raced via `tokio::select!` against whatever
    /// work should stop early (an HTTP call, the next tick).
    pub async fn cancelled(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_immediately_once_triggered() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(50), signal.cancelled())
            .await
            .expect("cancelled() should resolve without waiting");
    }

    #[tokio::test]
    async fn cancelled_wakes_a_waiter_registered_before_trigger() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signal.is_triggered());
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(50), waiter)
            .await
            .expect("waiter should be woken by trigger()")
            .unwrap();
    }
}
