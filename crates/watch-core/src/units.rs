//! Integer-only rendering of smallest-unit balances.

use crate::Balance;

/// Decimals of the chain's native coin.
pub const NATIVE_DECIMALS: u32 = 18;

/// Ticker used in human-readable messages.
pub const NATIVE_SYMBOL: &str = "BNB";

/// Render `amount` (in units of `10^-decimals`) with `places` fractional
/// digits, truncating the rest. `format_units(1_234_500_000_000_000_000, 18, 4)`
/// yields `"1.2345"`.
pub fn format_units(amount: Balance, decimals: u32, places: u32) -> String {
    let scale = 10u128.pow(decimals);
    let whole = amount / scale;
    let frac = amount % scale;
    if places == 0 {
        return whole.to_string();
    }
    let shown = if places >= decimals {
        frac * 10u128.pow(places - decimals)
    } else {
        frac / 10u128.pow(decimals - places)
    };
    let width = usize::try_from(places).unwrap_or(usize::MAX);
    format!("{whole}.{shown:0width$}")
}
