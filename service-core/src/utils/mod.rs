use subtle::ConstantTimeEq;

/// Constant-time equality for shared secrets.
///
/// Used to check the callback URL path token; a naive `==` would leak the
/// prefix length through timing.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();

    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}
