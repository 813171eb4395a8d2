use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signatures shared with the payment gateway.
///
/// Client-side verification signs `"{order_id}|{payment_id}"` with the payment
/// secret. Webhooks sign the raw request body with the webhook secret. Both are
/// lowercase hex on the wire.
#[derive(Clone)]
pub struct SignatureVerifier {
    payment_secret: Vec<u8>,
    webhook_secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

fn hmac_hex(secret: &[u8], message: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

fn matches(expected: &str, provided: &str) -> bool {
    let provided = provided.trim().to_ascii_lowercase();
    !expected.is_empty() && constant_time_eq::constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

impl SignatureVerifier {
    pub fn new(payment_secret: impl Into<Vec<u8>>, webhook_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            payment_secret: payment_secret.into(),
            webhook_secret: webhook_secret.into(),
        }
    }

    pub fn sign_payment(&self, order_id: &str, payment_id: &str) -> String {
        hmac_hex(&self.payment_secret, format!("{order_id}|{payment_id}").as_bytes())
    }

    pub fn verify_payment(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        matches(&self.sign_payment(order_id, payment_id), signature)
    }

    pub fn sign_webhook(&self, body: &[u8]) -> String {
        hmac_hex(&self.webhook_secret, body)
    }

    pub fn verify_webhook(&self, body: &[u8], signature: &str) -> bool {
        matches(&self.sign_webhook(body), signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_signature_roundtrips() {
        let v = SignatureVerifier::new("s3cret", "hook");
        let sig = v.sign_payment("order_1", "pay_1");
        assert_eq!(sig.len(), 64);
        assert!(v.verify_payment("order_1", "pay_1", &sig));
        assert!(v.verify_payment("order_1", "pay_1", &sig.to_uppercase()));
    }

    #[test]
    fn payment_signature_binds_both_ids() {
        let v = SignatureVerifier::new("s3cret", "hook");
        let sig = v.sign_payment("order_1", "pay_1");
        assert!(!v.verify_payment("order_2", "pay_1", &sig));
        assert!(!v.verify_payment("order_1", "pay_2", &sig));
        assert!(!v.verify_payment("order_1", "pay_1", ""));
    }

    #[test]
    fn secrets_are_not_interchangeable() {
        let a = SignatureVerifier::new("one", "hook");
        let b = SignatureVerifier::new("two", "hook");
        let sig = a.sign_payment("o", "p");
        assert!(!b.verify_payment("o", "p", &sig));

        let body = br#"{"event":"payment.captured"}"#;
        let hook_sig = a.sign_webhook(body);
        assert!(a.verify_webhook(body, &hook_sig));
        assert!(!a.verify_payment("o", "p", &hook_sig));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        let v = SignatureVerifier::new("x", "Jefe");
        assert_eq!(
            v.sign_webhook(b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
