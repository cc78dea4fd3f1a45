//! HMAC-signed media URLs.
//!
//! Task ISOs are fetched by BMCs over plain HTTP, so access is gated by a
//! time-bound (and optionally IP-bound) signature instead of credentials.
//! The canonical string is `"GET\n{path}\n{expires}\n{ip}"`, signed with
//! HMAC-SHA256 and base64url-encoded. Verification failures are
//! indistinguishable from each other by design: the handler answers 403 for
//! expired, tampered, and missing signatures alike.

use std::net::IpAddr;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between the controller and whatever minted the URL.
const SKEW_TOLERANCE_SECS: i64 = 60;

pub struct UrlSigner {
    base_url: String,
    secret: Option<Vec<u8>>,
    ttl: Duration,
    bind_ip: bool,
}

/// Query parameters presented with a media request.
#[derive(Debug, Default, Clone)]
pub struct MediaAuth<'a> {
    pub expires: Option<&'a str>,
    pub sig: Option<&'a str>,
    pub ip: Option<&'a str>,
}

impl UrlSigner {
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        ttl: Duration,
        bind_ip: bool,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.map(String::into_bytes),
            ttl,
            bind_ip,
        }
    }

    pub fn media_path(job_id: Uuid) -> String {
        format!("/media/tasks/{job_id}/task.iso")
    }

    /// Mint a fetchable URL for a job's task ISO. Without a configured secret
    /// this is just the plain URL.
    pub fn mint(&self, job_id: Uuid, client_ip: Option<IpAddr>) -> String {
        let expires = (Utc::now() + chrono::Duration::seconds(self.ttl.as_secs() as i64))
            .timestamp();
        self.mint_with_expiry(job_id, expires, client_ip)
    }

    /// Mint with an explicit expiry timestamp.
    pub fn mint_with_expiry(
        &self,
        job_id: Uuid,
        expires: i64,
        client_ip: Option<IpAddr>,
    ) -> String {
        let path = Self::media_path(job_id);
        let Some(secret) = &self.secret else {
            return format!("{}{}", self.base_url, path);
        };
        let ip = match (self.bind_ip, client_ip) {
            (true, Some(ip)) => ip.to_string(),
            _ => String::new(),
        };
        let sig = sign(secret, &path, expires, &ip);

        let mut url = format!("{}{}?expires={}&sig={}", self.base_url, path, expires, sig);
        if !ip.is_empty() {
            url.push_str("&ip=");
            url.push_str(&ip);
        }
        url
    }

    /// Check a media request. With no secret configured everything passes.
    pub fn verify(
        &self,
        path: &str,
        auth: &MediaAuth<'_>,
        client_ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(secret) = &self.secret else {
            return true;
        };

        let (Some(expires_raw), Some(sig_raw)) = (auth.expires, auth.sig) else {
            return false;
        };
        let Ok(expires) = expires_raw.parse::<i64>() else {
            return false;
        };
        if now.timestamp() > expires + SKEW_TOLERANCE_SECS {
            return false;
        }

        let ip = auth.ip.unwrap_or("");
        if self.bind_ip && !ip.is_empty() {
            let Some(client_ip) = client_ip else {
                return false;
            };
            if ip != client_ip.to_string() {
                return false;
            }
        }

        let Ok(sig) = URL_SAFE_NO_PAD.decode(sig_raw) else {
            return false;
        };

        let canonical = canonical_string(path, expires, ip);
        let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
            return false;
        };
        mac.update(canonical.as_bytes());
        mac.verify_slice(&sig).is_ok()
    }
}

fn canonical_string(path: &str, expires: i64, ip: &str) -> String {
    format!("GET\n{path}\n{expires}\n{ip}")
}

fn sign(secret: &[u8], path: &str, expires: i64, ip: &str) -> String {
    // new_from_slice accepts any key length for HMAC.
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(canonical_string(path, expires, ip).as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(bind_ip: bool) -> UrlSigner {
        UrlSigner::new(
            "http://ctl:8080",
            Some("sekrit".to_string()),
            Duration::from_secs(600),
            bind_ip,
        )
    }

    fn parse_query(url: &str) -> (String, MediaAuthOwned) {
        let (path, query) = url
            .trim_start_matches("http://ctl:8080")
            .split_once('?')
            .unwrap();
        let mut auth = MediaAuthOwned::default();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "expires" => auth.expires = Some(v.to_string()),
                "sig" => auth.sig = Some(v.to_string()),
                "ip" => auth.ip = Some(v.to_string()),
                other => panic!("unexpected query key {other}"),
            }
        }
        (path.to_string(), auth)
    }

    #[derive(Default)]
    struct MediaAuthOwned {
        expires: Option<String>,
        sig: Option<String>,
        ip: Option<String>,
    }

    impl MediaAuthOwned {
        fn borrow(&self) -> MediaAuth<'_> {
            MediaAuth {
                expires: self.expires.as_deref(),
                sig: self.sig.as_deref(),
                ip: self.ip.as_deref(),
            }
        }
    }

    #[test]
    fn unsigned_when_no_secret_configured() {
        let signer = UrlSigner::new("http://ctl:8080", None, Duration::from_secs(600), false);
        let job_id = Uuid::new_v4();
        let url = signer.mint(job_id, None);
        assert_eq!(
            url,
            format!("http://ctl:8080/media/tasks/{job_id}/task.iso")
        );
        assert!(signer.verify(
            &UrlSigner::media_path(job_id),
            &MediaAuth::default(),
            None,
            Utc::now()
        ));
    }

    #[test]
    fn minted_url_verifies() {
        let signer = signer(false);
        let job_id = Uuid::new_v4();
        let (path, auth) = parse_query(&signer.mint(job_id, None));
        assert!(signer.verify(&path, &auth.borrow(), None, Utc::now()));
    }

    #[test]
    fn tampered_signature_rejected() {
        let signer = signer(false);
        let (path, mut auth) = parse_query(&signer.mint(Uuid::new_v4(), None));

        let sig = auth.sig.take().unwrap();
        let flipped = if sig.starts_with('A') { "B" } else { "A" };
        auth.sig = Some(format!("{flipped}{}", &sig[1..]));
        assert!(!signer.verify(&path, &auth.borrow(), None, Utc::now()));
    }

    #[test]
    fn signature_for_other_job_rejected() {
        let signer = signer(false);
        let (_, auth) = parse_query(&signer.mint(Uuid::new_v4(), None));
        let other_path = UrlSigner::media_path(Uuid::new_v4());
        assert!(!signer.verify(&other_path, &auth.borrow(), None, Utc::now()));
    }

    #[test]
    fn expiry_honors_skew_tolerance() {
        let signer = signer(false);
        let (path, auth) = parse_query(&signer.mint(Uuid::new_v4(), None));
        let expires: i64 = auth.expires.as_deref().unwrap().parse().unwrap();

        let just_inside = DateTime::from_timestamp(expires + SKEW_TOLERANCE_SECS, 0).unwrap();
        assert!(signer.verify(&path, &auth.borrow(), None, just_inside));

        let just_outside = DateTime::from_timestamp(expires + SKEW_TOLERANCE_SECS + 1, 0).unwrap();
        assert!(!signer.verify(&path, &auth.borrow(), None, just_outside));
    }

    #[test]
    fn missing_parameters_rejected() {
        let signer = signer(false);
        let job_id = Uuid::new_v4();
        assert!(!signer.verify(
            &UrlSigner::media_path(job_id),
            &MediaAuth::default(),
            None,
            Utc::now()
        ));
    }

    #[test]
    fn ip_binding_checks_effective_client() {
        let signer = signer(true);
        let bmc: IpAddr = "10.1.2.3".parse().unwrap();
        let (path, auth) = parse_query(&signer.mint(Uuid::new_v4(), Some(bmc)));
        assert_eq!(auth.ip.as_deref(), Some("10.1.2.3"));

        assert!(signer.verify(&path, &auth.borrow(), Some(bmc), Utc::now()));
        let stranger: IpAddr = "10.9.9.9".parse().unwrap();
        assert!(!signer.verify(&path, &auth.borrow(), Some(stranger), Utc::now()));
        assert!(!signer.verify(&path, &auth.borrow(), None, Utc::now()));
    }

    #[test]
    fn unbound_mint_when_client_ip_unknown() {
        let signer = signer(true);
        let (path, auth) = parse_query(&signer.mint(Uuid::new_v4(), None));
        assert!(auth.ip.is_none());
        // Still verifiable from anywhere: the canonical ip was empty.
        let anyone: IpAddr = "192.0.2.7".parse().unwrap();
        assert!(signer.verify(&path, &auth.borrow(), Some(anyone), Utc::now()));
    }
}
