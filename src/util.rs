//! Random fixtures for tests and the soak binary

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;

pub const CURRENCIES: [&str; 3] = ["USD", "EUR", "CAD"];

/// Uniform integer in `min..=max`
pub fn random_int(min: i64, max: i64) -> i64 {
    rand::thread_rng().gen_range(min..=max)
}

/// Lowercase ascii string of length `n`
pub fn random_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .filter(u8::is_ascii_alphabetic)
        .take(n)
        .map(|b| char::from(b.to_ascii_lowercase()))
        .collect()
}

pub fn random_owner() -> String {
    random_string(6)
}

pub fn random_money() -> i64 {
    random_int(0, 1000)
}

pub fn random_currency() -> &'static str {
    CURRENCIES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("USD")
}
