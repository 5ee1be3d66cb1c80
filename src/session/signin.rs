//! Daily sign-in calendar, one bitmap per user per year.
//!
//! Bit `n` of `user:signins:{year}:{user_id}` is set when the user signed in
//! on the `n`th day of that year (January 1st is day 1). Bits are numbered
//! most-significant first within each byte, the way Redis SETBIT numbers
//! them.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use tracing::debug;

use crate::domain::ports::{FastCache, UserId};
use crate::error::Result;

pub const SIGNIN_KEY_PREFIX: &str = "user:signins";

/// Index of the first set bit at or after `start`, or `None`.
pub fn next_set_bit(bitmap: &[u8], start: usize) -> Option<usize> {
    let mut byte_index = start / 8;
    if byte_index >= bitmap.len() {
        return None;
    }

    // Mask off bits before `start` in the first byte
    let first = bitmap[byte_index] & (0xFFu8 >> (start % 8));
    if first != 0 {
        return Some(byte_index * 8 + first.leading_zeros() as usize);
    }

    byte_index += 1;
    bitmap[byte_index..]
        .iter()
        .position(|&b| b != 0)
        .map(|offset| {
            let index = byte_index + offset;
            index * 8 + bitmap[index].leading_zeros() as usize
        })
}

pub struct SignInCalendar {
    cache: Arc<dyn FastCache>,
}

impl SignInCalendar {
    pub fn new(cache: Arc<dyn FastCache>) -> Self {
        Self { cache }
    }

    pub fn key(user_id: UserId, year: i32) -> String {
        format!("{}:{}:{}", SIGNIN_KEY_PREFIX, year, user_id)
    }

    /// Mark `date` as signed in. Returns true the first time per day.
    pub async fn record(&self, user_id: UserId, date: NaiveDate) -> Result<bool> {
        let was_set = self
            .cache
            .set_bit(&Self::key(user_id, date.year()), u64::from(date.ordinal()), true)
            .await?;

        if !was_set {
            debug!(user_id = %user_id, %date, "Sign-in recorded");
        }
        Ok(!was_set)
    }

    /// Days of `year` (1-based ordinals) the user signed in, ascending.
    pub async fn days(&self, user_id: UserId, year: i32) -> Result<Vec<u32>> {
        let Some(bitmap) = self.cache.get(&Self::key(user_id, year)).await? else {
            return Ok(Vec::new());
        };

        let mut days = Vec::new();
        let mut cursor = 0;
        while let Some(bit) = next_set_bit(&bitmap, cursor) {
            days.push(bit as u32);
            cursor = bit + 1;
        }
        Ok(days)
    }

    pub async fn signed_in_on(&self, user_id: UserId, date: NaiveDate) -> Result<bool> {
        let days = self.days(user_id, date.year()).await?;
        Ok(days.binary_search(&date.ordinal()).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryFastCache;
    use proptest::prelude::*;

    #[test]
    fn test_next_set_bit() {
        let bitmap = [0b0100_0000u8, 0, 0b0000_0001];
        assert_eq!(next_set_bit(&bitmap, 0), Some(1));
        assert_eq!(next_set_bit(&bitmap, 1), Some(1));
        assert_eq!(next_set_bit(&bitmap, 2), Some(23));
        assert_eq!(next_set_bit(&bitmap, 24), None);
        assert_eq!(next_set_bit(&[], 0), None);
    }

    #[tokio::test]
    async fn test_record_and_list_days() {
        let calendar = SignInCalendar::new(Arc::new(InMemoryFastCache::new()));
        let user = UserId::new(7);
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let dec31 = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();

        assert!(calendar.record(user, jan1).await.unwrap());
        assert!(!calendar.record(user, jan1).await.unwrap());
        assert!(calendar.record(user, dec31).await.unwrap());

        assert_eq!(calendar.days(user, 2024).await.unwrap(), vec![1, 366]);
        assert!(calendar.days(user, 2023).await.unwrap().is_empty());
        assert!(calendar.signed_in_on(user, dec31).await.unwrap());
    }

    proptest! {
        #[test]
        fn prop_next_set_bit_matches_linear_scan(
            bitmap in proptest::collection::vec(any::<u8>(), 0..48),
            start in 0usize..400,
        ) {
            let expected = (start..bitmap.len() * 8)
                .find(|&i| bitmap[i / 8] & (0x80 >> (i % 8)) != 0);
            prop_assert_eq!(next_set_bit(&bitmap, start), expected);
        }
    }
}
