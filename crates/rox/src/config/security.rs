//! Configuration authenticity: RSA-SHA256 signature verification against the
//! embedded service certificate, and the api-key ownership check.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::Sha256;
use tracing::error;
use x509_parser::prelude::*;

// X.509 certificate (base64 DER) whose public key signs every configuration
// payload the service emits.
const ROX_CERTIFICATE_BASE64: &str = "MIIDWDCCAkACCQDR039HDUMyzTANBgkqhkiG9w0BAQUFADBuMQswCQYDVQQHEwJjYTETMBEGA1UEChMKcm9sbG91dC5pbzERMA8GA1UECxMIc2VjdXJpdHkxFzAVBgNVBAMTDnd3dy5yb2xsb3V0LmlvMR4wHAYJKoZIhvcNAQkBFg9leWFsQHJvbGxvdXQuaW8wHhcNMTQwODE4MDkzNjAyWhcNMjQwODE1MDkzNjAyWjBuMQswCQYDVQQHEwJjYTETMBEGA1UEChMKcm9sbG91dC5pbzERMA8GA1UECxMIc2VjdXJpdHkxFzAVBgNVBAMTDnd3dy5yb2xsb3V0LmlvMR4wHAYJKoZIhvcNAQkBFg9leWFsQHJvbGxvdXQuaW8wggEiMA0GCSqGSIb3DQEBAQUAA4IBDwAwggEKAoIBAQDq8GMRFLyaQVDEdcHlYm7NnGrAqhLP2E/27W21yTQein7r8FOT/7jJ0PLpcGLw/3zDT5wzIJ3OtFy4HWre2hn7wmt+bI+bbS/9kKrmqkpjAj1+PwnB4lhEad27lolMCuz5purqi209k7q51IMdfq0/Ot7P/Bmp+LBNs2F4jMsPYxZUUYkVTAmPqgnwxuWoJZan/OGNjtj9OGg8eOcOfcyxC4GDR/Yail+kht4I/HHesSXVukqXntsbdgnXKFkX682TuFPc3pd8ly+6N6OSWpbNV8UmEVZygnxWT3vxBT2TWvFexbW52KOFY91wIkjt+IPEMPJBPPDiN9J2nuttvfMpAgMBAAEwDQYJKoZIhvcNAQEFBQADggEBAIXrD6YsIhZa6fYDAR8huP0V3BRwMKjeLGLCXLzvuPaoQGDhn4RJNgz3leNcomIkV/AwneeS9BXgBAcEKjNeLD+nW58RSRnAfxDT5cUtQgIeR6dFmEK05u+8j/cK3VO410xr0taNMbmJfEn07WjfCdcJS3hsGJuVmEUC85KYznbIcafQMGklLYArXYVnR3XKqzxcLohSPX99weujH5wt78Zy3pXxuYCDETwhgcCYCQaZz7mpvtSOub3JQT+Ir5cBSdyI1oPI2dIamUL5+ntTyll/1rbYj83qREw8PKA9Q0KIIgfpggy19TS9zknwOLz44wRdLyT2tFoaiRqHvm6JKaA=";

pub struct SignatureVerifier {
    key: Option<VerifyingKey<Sha256>>,
}

impl SignatureVerifier {
    pub fn new() -> SignatureVerifier {
        SignatureVerifier::with_certificate(ROX_CERTIFICATE_BASE64)
    }

    fn with_certificate(certificate_base64: &str) -> SignatureVerifier {
        let key = load_verifying_key(certificate_base64);
        if key.is_none() {
            error!("embedded signing certificate could not be parsed");
        }
        SignatureVerifier { key }
    }

    /// Verifies the base64-encoded RSA-SHA256 signature over `data`.
    pub fn verify(&self, data: &[u8], signature_base64: &str) -> bool {
        let Some(key) = &self.key else {
            return false;
        };
        let Ok(signature_bytes) = BASE64.decode(signature_base64.trim()) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(signature_bytes.as_slice()) else {
            return false;
        };
        key.verify(data, &signature).is_ok()
    }
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        SignatureVerifier::new()
    }
}

fn load_verifying_key(certificate_base64: &str) -> Option<VerifyingKey<Sha256>> {
    let der = BASE64.decode(certificate_base64).ok()?;
    let (_, certificate) = X509Certificate::from_der(&der).ok()?;
    let public_key = RsaPublicKey::from_public_key_der(certificate.public_key().raw).ok()?;
    Some(VerifyingKey::new(public_key))
}

/// The payload belongs to this environment iff its `application` field is
/// byte-equal to the configured api key.
pub fn api_key_matches(configured: &str, application: &str) -> bool {
    configured == application
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_certificate_parses() {
        let verifier = SignatureVerifier::new();
        assert!(verifier.key.is_some());
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let verifier = SignatureVerifier::new();
        assert!(!verifier.verify(b"payload", "not-base64!!"));
        assert!(!verifier.verify(b"payload", &BASE64.encode([0u8; 16])));
        assert!(!verifier.verify(b"payload", &BASE64.encode([0u8; 256])));
    }

    #[test]
    fn broken_certificate_rejects_everything() {
        let verifier = SignatureVerifier::with_certificate("AAAA");
        assert!(!verifier.verify(b"payload", &BASE64.encode([0u8; 256])));
    }

    #[test]
    fn api_key_check_is_byte_equality() {
        assert!(api_key_matches("abc123", "abc123"));
        assert!(!api_key_matches("abc123", "abc124"));
        assert!(!api_key_matches("abc123", "ABC123"));
    }
}
