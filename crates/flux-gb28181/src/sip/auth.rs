// GB28181 Digest 鉴权（MD5, qop=auth）
// 服务端：REGISTER 401 挑战 / 校验；客户端：级联上级平台的挑战缓存与凭证重放

use super::message::SipRequest;
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// nonce 有效期
pub const NONCE_TTL: Duration = Duration::from_secs(5);

/// 解析 Digest 参数列表（`Digest k="v", k2=v2`）
pub fn parse_digest_params(value: &str) -> Option<HashMap<String, String>> {
    let rest = value.trim();
    let rest = match rest.get(..7) {
        Some(p) if p.eq_ignore_ascii_case("digest ") => &rest[7..],
        _ => rest,
    };

    let mut map = HashMap::new();
    for part in super::message::split_header_list(rest) {
        if let Some(eq_idx) = part.find('=') {
            let key = part[..eq_idx].trim().to_ascii_lowercase();
            let mut val = part[eq_idx + 1..].trim();
            if val.len() >= 2 && val.starts_with('"') && val.ends_with('"') {
                val = &val[1..val.len() - 1];
            }
            map.insert(key, val.to_string());
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn md5_hex(s: &str) -> String {
    format!("{:x}", md5::compute(s))
}

/// qop=auth 时参与计算的字段
#[derive(Debug, Clone, Copy)]
pub struct QopParams<'a> {
    pub qop: &'a str,
    pub nc: &'a str,
    pub cnonce: &'a str,
}

/// 计算 Digest response（RFC 2617）
pub fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<QopParams<'_>>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some(q) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, q.nc, q.cnonce, q.qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// WWW-Authenticate 挑战
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn new(realm: &str, nonce: String) -> Self {
        Self {
            realm: realm.to_string(),
            nonce,
            opaque: None,
            algorithm: Some("MD5".to_string()),
            qop: Some("auth".to_string()),
            stale: false,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let params = parse_digest_params(value)?;
        Some(Self {
            realm: params.get("realm")?.clone(),
            nonce: params.get("nonce")?.clone(),
            opaque: params.get("opaque").cloned(),
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
            stale: params
                .get("stale")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    pub fn to_header(&self) -> String {
        let mut out = format!("Digest realm=\"{}\", nonce=\"{}\"", self.realm, self.nonce);
        if let Some(opaque) = &self.opaque {
            out.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        if let Some(algorithm) = &self.algorithm {
            out.push_str(&format!(", algorithm={}", algorithm));
        }
        if let Some(qop) = &self.qop {
            out.push_str(&format!(", qop=\"{}\"", qop));
        }
        if self.stale {
            out.push_str(", stale=TRUE");
        }
        out
    }

    /// 质询中 qop 是否包含 auth
    fn offers_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

/// Authorization 凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl DigestCredentials {
    pub fn parse(value: &str) -> Option<Self> {
        let params = parse_digest_params(value)?;
        Some(Self {
            username: params.get("username")?.clone(),
            realm: params.get("realm").cloned().unwrap_or_default(),
            nonce: params.get("nonce")?.clone(),
            uri: params.get("uri")?.clone(),
            response: params.get("response")?.clone(),
            algorithm: params.get("algorithm").cloned(),
            opaque: params.get("opaque").cloned(),
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
        })
    }

    pub fn to_header(&self) -> String {
        let mut out = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, self.realm, self.nonce, self.uri, self.response
        );
        if let Some(algorithm) = &self.algorithm {
            out.push_str(&format!(", algorithm={}", algorithm));
        }
        if let Some(opaque) = &self.opaque {
            out.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        if let (Some(qop), Some(nc), Some(cnonce)) = (&self.qop, &self.nc, &self.cnonce) {
            out.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        out
    }

    /// 用已知密码校验 response
    pub fn verify(&self, method: &str, password: &str) -> bool {
        let qop = match (&self.qop, &self.nc, &self.cnonce) {
            (Some(qop), Some(nc), Some(cnonce)) => Some(QopParams { qop, nc, cnonce }),
            _ => None,
        };
        let expected = compute_digest_response(
            &self.username,
            &self.realm,
            password,
            method,
            &self.uri,
            &self.nonce,
            qop,
        );
        expected.eq_ignore_ascii_case(&self.response)
    }
}

/// 一次性 nonce 缓存（TTL 淘汰）
pub struct NonceCache {
    nonces: DashMap<String, Instant>,
    ttl: Duration,
}

impl NonceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            nonces: DashMap::new(),
            ttl,
        }
    }

    /// 生成 32 位十六进制 nonce
    pub fn issue(&self, now: Instant) -> String {
        let ttl = self.ttl;
        self.nonces
            .retain(|_, issued| now.saturating_duration_since(*issued) <= ttl);
        let nonce = format!("{:032x}", rand::thread_rng().gen::<u128>());
        self.nonces.insert(nonce.clone(), now);
        nonce
    }

    /// 消费 nonce：只有首次使用且在有效期内才返回 true
    pub fn consume(&self, nonce: &str, now: Instant) -> bool {
        match self.nonces.remove(nonce) {
            Some((_, issued)) => now.saturating_duration_since(issued) <= self.ttl,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

/// REGISTER 鉴权结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized,
    /// 返回 401，值为 WWW-Authenticate
    Challenge(String),
    /// 返回 403
    Forbidden(String),
}

/// 注册服务端的 Digest 鉴权器
pub struct DigestAuthenticator {
    realm: String,
    nonces: NonceCache,
}

impl DigestAuthenticator {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            nonces: NonceCache::new(NONCE_TTL),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn challenge(&self, now: Instant, stale: bool) -> String {
        let mut challenge = DigestChallenge::new(&self.realm, self.nonces.issue(now));
        challenge.stale = stale;
        challenge.to_header()
    }

    /// 校验请求；`password` 为 None 表示未启用鉴权
    pub fn verify(
        &self,
        req: &SipRequest,
        device_id: &str,
        password: Option<&str>,
        now: Instant,
    ) -> AuthOutcome {
        let Some(password) = password else {
            return AuthOutcome::Authorized;
        };

        let Some(creds) = req
            .headers
            .get("Authorization")
            .and_then(DigestCredentials::parse)
        else {
            return AuthOutcome::Challenge(self.challenge(now, false));
        };

        // nonce 过期或重放：重新挑战
        if !self.nonces.consume(&creds.nonce, now) {
            tracing::debug!(
                target: "gb28181::sip",
                %device_id,
                "digest nonce expired or reused"
            );
            return AuthOutcome::Challenge(self.challenge(now, true));
        }

        if creds.username != device_id {
            return AuthOutcome::Forbidden(format!(
                "username {} does not match device {}",
                creds.username, device_id
            ));
        }

        if creds.realm != self.realm {
            return AuthOutcome::Forbidden(format!("realm {} is not {}", creds.realm, self.realm));
        }
        let qop_auth = creds
            .qop
            .as_deref()
            .map(|q| q.trim_matches('"').eq_ignore_ascii_case("auth"))
            .unwrap_or(false);
        if !qop_auth || creds.nc.is_none() || creds.cnonce.is_none() {
            return AuthOutcome::Forbidden("digest without qop=auth".to_string());
        }

        if !creds.verify(req.method.as_str(), password) {
            return AuthOutcome::Forbidden("digest response mismatch".to_string());
        }

        AuthOutcome::Authorized
    }
}

/// 客户端挑战缓存：记录每个目标最近一次 401，并为后续请求生成凭证
#[derive(Default)]
pub struct ChallengeCache {
    challenges: DashMap<String, (DigestChallenge, u32)>,
    cnonce_seed: AtomicU32,
}

impl ChallengeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, target: &str, challenge: DigestChallenge) {
        self.challenges.insert(target.to_string(), (challenge, 0));
    }

    pub fn clear(&self, target: &str) {
        self.challenges.remove(target);
    }

    pub fn has(&self, target: &str) -> bool {
        self.challenges.contains_key(target)
    }

    /// 为目标生成 Authorization 头部，nc 递增
    pub fn authorization(
        &self,
        target: &str,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
    ) -> Option<String> {
        let mut entry = self.challenges.get_mut(target)?;
        let (challenge, nc) = entry.value_mut();
        *nc += 1;

        let use_qop = challenge.offers_auth_qop();
        let nc_str = format!("{:08x}", nc);
        let cnonce = format!(
            "{:08x}",
            self.cnonce_seed.fetch_add(1, Ordering::Relaxed) ^ rand::thread_rng().gen::<u32>()
        );

        let response = compute_digest_response(
            username,
            &challenge.realm,
            password,
            method,
            uri,
            &challenge.nonce,
            use_qop.then_some(QopParams {
                qop: "auth",
                nc: &nc_str,
                cnonce: &cnonce,
            }),
        );

        let creds = DigestCredentials {
            username: username.to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            algorithm: Some("MD5".to_string()),
            opaque: challenge.opaque.clone(),
            qop: use_qop.then(|| "auth".to_string()),
            nc: use_qop.then(|| nc_str.clone()),
            cnonce: use_qop.then(|| cnonce.clone()),
        };
        Some(creds.to_header())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::message::SipMethod;

    const DEVICE: &str = "34020000001320000001";
    const REALM: &str = "3402000000";

    fn register_with(auth: Option<String>) -> SipRequest {
        let mut req = SipRequest::new(SipMethod::Register, "sip:34020000002000000001@3402000000");
        req.add_header("From", format!("<sip:{}@{}>;tag=1", DEVICE, REALM));
        req.add_header("To", format!("<sip:{}@{}>", DEVICE, REALM));
        if let Some(a) = auth {
            req.add_header("Authorization", a);
        }
        req
    }

    fn sign(nonce: &str, password: &str) -> String {
        let uri = "sip:34020000002000000001@3402000000";
        let response = compute_digest_response(
            DEVICE,
            REALM,
            password,
            "REGISTER",
            uri,
            nonce,
            Some(QopParams { qop: "auth", nc: "00000001", cnonce: "0a4f113b" }),
        );
        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5, qop=auth, nc=00000001, cnonce=\"0a4f113b\"",
            DEVICE, REALM, nonce, uri, response
        )
    }

    fn nonce_of(outcome: &AuthOutcome) -> String {
        match outcome {
            AuthOutcome::Challenge(h) => DigestChallenge::parse(h).unwrap().nonce,
            other => panic!("expected challenge, got {:?}", other),
        }
    }

    #[test]
    fn test_rfc2617_vector() {
        // RFC 2617 §3.5 示例
        let resp = compute_digest_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some(QopParams { qop: "auth", nc: "00000001", cnonce: "0a4f113b" }),
        );
        assert_eq!(resp, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_nonce_format() {
        let cache = NonceCache::new(NONCE_TTL);
        let nonce = cache.issue(Instant::now());
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_register_challenge_then_authorized() {
        let auth = DigestAuthenticator::new(REALM);
        let now = Instant::now();

        let first = auth.verify(&register_with(None), DEVICE, Some("12345678"), now);
        let nonce = nonce_of(&first);

        let req = register_with(Some(sign(&nonce, "12345678")));
        let second = auth.verify(&req, DEVICE, Some("12345678"), now + Duration::from_secs(2));
        assert_eq!(second, AuthOutcome::Authorized);
    }

    #[test]
    fn test_nonce_reuse_rechallenges() {
        let auth = DigestAuthenticator::new(REALM);
        let now = Instant::now();
        let nonce = nonce_of(&auth.verify(&register_with(None), DEVICE, Some("pw"), now));
        let req = register_with(Some(sign(&nonce, "pw")));

        assert_eq!(auth.verify(&req, DEVICE, Some("pw"), now), AuthOutcome::Authorized);
        let replay = auth.verify(&req, DEVICE, Some("pw"), now);
        let fresh = nonce_of(&replay);
        assert_ne!(fresh, nonce);
    }

    #[test]
    fn test_expired_nonce_rechallenges() {
        let auth = DigestAuthenticator::new(REALM);
        let now = Instant::now();
        let nonce = nonce_of(&auth.verify(&register_with(None), DEVICE, Some("pw"), now));
        let req = register_with(Some(sign(&nonce, "pw")));

        let late = auth.verify(&req, DEVICE, Some("pw"), now + Duration::from_millis(5001));
        assert!(matches!(late, AuthOutcome::Challenge(_)));
    }

    #[test]
    fn test_wrong_password_forbidden() {
        let auth = DigestAuthenticator::new(REALM);
        let now = Instant::now();
        let nonce = nonce_of(&auth.verify(&register_with(None), DEVICE, Some("pw"), now));
        let req = register_with(Some(sign(&nonce, "wrong")));
        assert!(matches!(
            auth.verify(&req, DEVICE, Some("pw"), now),
            AuthOutcome::Forbidden(_)
        ));
    }

    #[test]
    fn test_foreign_realm_forbidden() {
        let auth = DigestAuthenticator::new(REALM);
        let now = Instant::now();
        let nonce = nonce_of(&auth.verify(&register_with(None), DEVICE, Some("pw"), now));

        // 用对端自带的 realm 计算出的摘要也不接受
        let uri = "sip:34020000002000000001@3402000000";
        let response = compute_digest_response(
            DEVICE,
            "4401000000",
            "pw",
            "REGISTER",
            uri,
            &nonce,
            Some(QopParams { qop: "auth", nc: "00000001", cnonce: "0a4f113b" }),
        );
        let header = format!(
            "Digest username=\"{}\", realm=\"4401000000\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5, qop=auth, nc=00000001, cnonce=\"0a4f113b\"",
            DEVICE, nonce, uri, response
        );
        assert!(matches!(
            auth.verify(&register_with(Some(header)), DEVICE, Some("pw"), now),
            AuthOutcome::Forbidden(_)
        ));
    }

    #[test]
    fn test_digest_without_qop_forbidden() {
        let auth = DigestAuthenticator::new(REALM);
        let now = Instant::now();
        let nonce = nonce_of(&auth.verify(&register_with(None), DEVICE, Some("pw"), now));

        let uri = "sip:34020000002000000001@3402000000";
        let response = compute_digest_response(DEVICE, REALM, "pw", "REGISTER", uri, &nonce, None);
        let header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            DEVICE, REALM, nonce, uri, response
        );
        assert!(matches!(
            auth.verify(&register_with(Some(header)), DEVICE, Some("pw"), now),
            AuthOutcome::Forbidden(_)
        ));
    }

    #[test]
    fn test_nonce_cache_expires_old_entries() {
        let cache = NonceCache::new(Duration::from_secs(5));
        let now = Instant::now();
        let old = cache.issue(now);
        cache.issue(now + Duration::from_secs(1));
        assert_eq!(cache.len(), 2);

        // 新签发时淘汰过期项
        cache.issue(now + Duration::from_secs(6));
        assert_eq!(cache.len(), 2);
        assert!(!cache.consume(&old, now + Duration::from_secs(6)));
    }

    #[test]
    fn test_auth_disabled() {
        let auth = DigestAuthenticator::new(REALM);
        assert_eq!(
            auth.verify(&register_with(None), DEVICE, None, Instant::now()),
            AuthOutcome::Authorized
        );
    }

    #[test]
    fn test_client_challenge_cache_roundtrip() {
        let cache = ChallengeCache::new();
        let challenge = DigestChallenge::new("3402000000", "0123456789abcdef0123456789abcdef".to_string());
        cache.store("superior", challenge);

        let header = cache
            .authorization("superior", "REGISTER", "sip:34020000002000000001@3402000000", "34020000002000000002", "pw")
            .unwrap();
        let creds = DigestCredentials::parse(&header).unwrap();
        assert_eq!(creds.nc.as_deref(), Some("00000001"));
        assert!(creds.verify("REGISTER", "pw"));
        assert!(!creds.verify("REGISTER", "other"));

        let second = cache
            .authorization("superior", "REGISTER", "sip:34020000002000000001@3402000000", "34020000002000000002", "pw")
            .unwrap();
        assert!(second.contains("nc=00000002"));
        assert!(cache.authorization("unknown", "REGISTER", "sip:x", "u", "p").is_none());
    }
}
