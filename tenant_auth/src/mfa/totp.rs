//! RFC 6238 time-based codes on top of `totp-rs`.
//!
//! Verification walks the skew window itself so the caller learns which time step
//! matched; the step is what replay protection records.

use chrono::{DateTime, Utc};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::crypto::{CredentialHasher, random};
use crate::errors::{AuthError, AuthResult};

/// Secret length in bytes (160 bits, the RFC 4226 recommendation)
const SECRET_LEN: usize = 20;

/// Code generation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotpParams {
    pub digits: usize,
    pub period_secs: u64,
    /// Steps accepted on either side of the current one
    pub skew: u8,
}

impl TotpParams {
    /// Time step containing `now`
    pub fn step_at(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.period_secs.max(1) as i64)
    }
}

/// Fresh base32-encoded secret
pub fn generate_secret() -> String {
    Secret::Raw(random::random_bytes(SECRET_LEN))
        .to_encoded()
        .to_string()
}

fn totp(secret: &str, params: TotpParams) -> AuthResult<TOTP> {
    let bytes = Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|e| AuthError::Totp(format!("invalid secret: {e:?}")))?;

    TOTP::new(
        Algorithm::SHA1,
        params.digits,
        params.skew,
        params.period_secs,
        bytes,
    )
    .map_err(|e| AuthError::Totp(e.to_string()))
}

/// Code for an explicit time step
pub fn code_at_step(secret: &str, params: TotpParams, step: i64) -> AuthResult<String> {
    let totp = totp(secret, params)?;
    let time = u64::try_from(step)
        .map_err(|_| AuthError::Totp("negative time step".into()))?
        .saturating_mul(params.period_secs);
    Ok(totp.generate(time))
}

/// Code for the step containing `now`
pub fn current_code(secret: &str, params: TotpParams, now: DateTime<Utc>) -> AuthResult<String> {
    code_at_step(secret, params, params.step_at(now))
}

/// Check a code against the skew window around `now`
///
/// # Returns
///
/// * `AuthResult<Option<i64>>` - Matching time step, `None` when no step in the window matches
pub fn verify(
    secret: &str,
    params: TotpParams,
    code: &str,
    now: DateTime<Utc>,
) -> AuthResult<Option<i64>> {
    let totp = totp(secret, params)?;
    let current = params.step_at(now);
    let skew = i64::from(params.skew);

    // Every candidate is compared so timing does not reveal the matching step
    let mut matched = None;
    for step in (current - skew)..=(current + skew) {
        let Ok(time) = u64::try_from(step) else {
            continue;
        };
        let expected = totp.generate(time.saturating_mul(params.period_secs));
        if CredentialHasher::constant_time_eq(&expected, code) && matched.is_none() {
            matched = Some(step);
        }
    }
    Ok(matched)
}

/// `otpauth://` provisioning URI for authenticator apps
pub fn provisioning_uri(issuer: &str, account: &str, secret: &str, params: TotpParams) -> String {
    let encode = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
        encode(issuer),
        encode(account),
        secret,
        encode(issuer),
        params.digits,
        params.period_secs
    )
}

/// Digits only, of the configured length
pub fn is_well_formed(code: &str, digits: usize) -> bool {
    code.len() == digits && code.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const PARAMS: TotpParams = TotpParams {
        digits: 6,
        period_secs: 30,
        skew: 1,
    };

    #[test]
    fn test_rfc6238_vector() {
        // RFC 6238 appendix B, SHA1 seed "12345678901234567890", T = 59
        let secret = Secret::Raw(b"12345678901234567890".to_vec())
            .to_encoded()
            .to_string();
        let params = TotpParams {
            digits: 8,
            ..PARAMS
        };
        assert_eq!(code_at_step(&secret, params, 1).unwrap(), "94287082");
    }

    #[test]
    fn test_skew_window() {
        let secret = generate_secret();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 10).unwrap();
        let step = PARAMS.step_at(now);

        for offset in -1..=1 {
            let code = code_at_step(&secret, PARAMS, step + offset).unwrap();
            assert_eq!(verify(&secret, PARAMS, &code, now).unwrap(), Some(step + offset));
        }

        let stale = current_code(&secret, PARAMS, now - Duration::seconds(60)).unwrap();
        if stale != current_code(&secret, PARAMS, now).unwrap() {
            assert_eq!(verify(&secret, PARAMS, &stale, now).unwrap(), None);
        }
    }

    #[test]
    fn test_invalid_secret() {
        assert!(matches!(
            verify("not base32!", PARAMS, "123456", Utc::now()),
            Err(AuthError::Totp(_))
        ));
    }

    #[test]
    fn test_provisioning_uri() {
        let uri = provisioning_uri("Tenant Auth", "ada@example.com", "JBSWY3DPEHPK3PXP", PARAMS);
        assert!(uri.starts_with("otpauth://totp/Tenant+Auth:ada%40example.com?secret=JBSWY3DPEHPK3PXP"));
        assert!(uri.ends_with("&digits=6&period=30"));
    }

    #[test]
    fn test_well_formed() {
        assert!(is_well_formed("012345", 6));
        assert!(!is_well_formed("01234", 6));
        assert!(!is_well_formed("01234a", 6));
    }
}
