//! Local wall-clock time for schedule matching.

use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

pub trait Clock: Send + Sync {
    /// Current local date and time.
    fn now(&self) -> PrimitiveDateTime;
}

pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Read the local UTC offset. Must run before any other thread exists,
    /// otherwise the OS offset is unavailable and UTC is used.
    pub fn detect() -> Self {
        let offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "local UTC offset unavailable, scheduling in UTC");
            UtcOffset::UTC
        });
        Self::new(offset)
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }
}

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        PrimitiveDateTime::new(now.date(), now.time())
    }
}
