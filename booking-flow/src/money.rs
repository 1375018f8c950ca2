/// Currency amounts travel as decimal values rounded to 2 places before any
/// comparison or persistence.
pub fn round2(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Equality at cent precision. Never compare raw floats for money.
pub fn cents_eq(a: f64, b: f64) -> bool {
    (round2(a) - round2(b)).abs() < 0.005
}
