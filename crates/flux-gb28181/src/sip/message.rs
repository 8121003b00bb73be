// SIP 消息解析和生成
// 支持 GB28181 标准的 SIP 消息格式（RFC 3261 子集）

use crate::{Gb28181Error, Result};
use rand::Rng;
use std::fmt;

pub const SIP_VERSION: &str = "SIP/2.0";
pub const BRANCH_MAGIC: &str = "z9hG4bK";

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
            SipMethod::Options => "OPTIONS",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "INFO" => Some(SipMethod::Info),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 头部紧凑形式到完整名称
fn canonical_name(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "k" | "K" => "Supported",
        "e" | "E" => "Content-Encoding",
        "s" | "S" => "Subject",
        "o" | "O" => "Event",
        _ => name,
    }
}

fn name_eq(a: &str, b: &str) -> bool {
    canonical_name(a).eq_ignore_ascii_case(canonical_name(b))
}

/// 有序、可重复的头部列表（Via / Record-Route 可出现多次）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// 取第一个同名头部（大小写不敏感，支持紧凑形式）
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| name_eq(k, name))
            .map(|(_, v)| v.as_str())
    }

    /// 取全部同名头部，逗号合并的值会被拆开
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| name_eq(k, name))
            .flat_map(|(_, v)| split_header_list(v))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 插入到所有头部之前（用于新增顶层 Via）
    pub fn prepend(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(0, (name.into(), value.into()));
    }

    /// 替换同名头部；不存在时追加
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(k, _)| name_eq(k, name)) {
            Some(pos) => {
                self.0[pos].1 = value;
                let mut idx = 0;
                self.0.retain(|(k, _)| {
                    let keep = idx <= pos || !name_eq(k, name);
                    idx += 1;
                    keep
                });
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !name_eq(k, name));
    }

    /// 修改第一个同名头部
    pub fn modify_first<F: FnOnce(&mut String)>(&mut self, name: &str, f: F) {
        if let Some((_, v)) = self.0.iter_mut().find(|(k, _)| name_eq(k, name)) {
            f(v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn call_id(&self) -> Option<&str> {
        self.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.get("CSeq").and_then(CSeq::parse)
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.get("From").and_then(|v| header_param(v, "tag"))
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.get("To").and_then(|v| header_param(v, "tag"))
    }

    pub fn top_via(&self) -> Option<&str> {
        self.get_all("Via").into_iter().next()
    }

    pub fn branch(&self) -> Option<&str> {
        self.top_via().and_then(|v| header_param(v, "branch"))
    }

    pub fn expires(&self) -> Option<u32> {
        self.get("Expires").and_then(|v| v.trim().parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }
}

/// 拆分逗号分隔的头部值，忽略尖括号和引号中的逗号
pub fn split_header_list(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth -= 1,
            ',' if !quoted && depth == 0 => {
                let part = value[start..i].trim();
                if !part.is_empty() {
                    out.push(part);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = value[start..].trim();
    if !last.is_empty() {
        out.push(last);
    }
    out
}

/// 读取头部参数，如 `tag`、`branch`、`expires`
///
/// 只看尖括号之外的参数，避免误读 URI 参数。
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|p| {
        let mut kv = p.splitn(2, '=');
        let key = kv.next()?.trim();
        if key.eq_ignore_ascii_case(name) {
            Some(kv.next().map(|v| v.trim().trim_matches('"')).unwrap_or(""))
        } else {
            None
        }
    })
}

/// 取出 name-addr 中的 URI
pub fn extract_uri(value: &str) -> &str {
    if let (Some(l), Some(r)) = (value.find('<'), value.rfind('>')) {
        if l < r {
            return &value[l + 1..r];
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// `sip:user@host:port` 中的 user 部分
pub fn uri_user(uri: &str) -> Option<&str> {
    let rest = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .unwrap_or(uri);
    let at = rest.find('@')?;
    Some(&rest[..at])
}

/// `sip:user@host:port;params` 中的 host:port 部分
pub fn uri_host_port(uri: &str) -> &str {
    let rest = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .unwrap_or(uri);
    let rest = match rest.find('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    };
    rest.split(|c: char| c == ';' || c == '>' || c == '?')
        .next()
        .unwrap_or(rest)
}

/// 给 From/To 头部追加 tag（已有则保持不变）
pub fn with_tag(value: &str, tag: &str) -> String {
    if header_param(value, "tag").is_some() {
        value.to_string()
    } else {
        format!("{};tag={}", value, tag)
    }
}

/// CSeq 头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn parse(value: &str) -> Option<Self> {
        let mut it = value.split_whitespace();
        let seq = it.next()?.parse().ok()?;
        let method = SipMethod::from_str(it.next()?)?;
        Some(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

pub fn new_tag() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

pub fn new_branch() -> String {
    format!("{}{:016x}", BRANCH_MAGIC, rand::thread_rng().gen::<u64>())
}

pub fn new_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), host)
}

fn split_head_body(s: &str) -> (&str, &str) {
    if let Some(pos) = s.find("\r\n\r\n") {
        (&s[..pos], &s[pos + 4..])
    } else if let Some(pos) = s.find("\n\n") {
        (&s[..pos], &s[pos + 2..])
    } else {
        (s, "")
    }
}

/// 解析头部行，支持折行
fn parse_header_lines<'a, I: Iterator<Item = &'a str>>(lines: I) -> Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.0.last_mut() {
                Some((_, v)) => {
                    v.push(' ');
                    v.push_str(line.trim());
                }
                None => return Err(Gb28181Error::Parse("Continuation without header".to_string())),
            }
            continue;
        }
        let pos = line
            .find(':')
            .ok_or_else(|| Gb28181Error::Parse(format!("Malformed header line: {}", line)))?;
        headers.push(line[..pos].trim(), line[pos + 1..].trim());
    }
    Ok(headers)
}

fn parse_body(headers: &Headers, raw: &str) -> Option<String> {
    let body = match headers.get("Content-Length").and_then(|v| v.trim().parse::<usize>().ok()) {
        Some(len) if len <= raw.len() && raw.is_char_boundary(len) => &raw[..len],
        _ => raw,
    };
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

fn write_headers_and_body(
    f: &mut fmt::Formatter<'_>,
    headers: &Headers,
    body: &Option<String>,
) -> fmt::Result {
    for (key, value) in headers.iter() {
        if name_eq(key, "Content-Length") {
            continue;
        }
        write!(f, "{}: {}\r\n", key, value)?;
    }
    let body = body.as_deref().unwrap_or("");
    write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body)
}

/// SIP 请求
#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: SIP_VERSION.to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push(key, value);
    }

    /// 设置消息体及 Content-Type
    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.headers.set("Content-Type", content_type);
        self.body = Some(body.into());
    }

    /// From 头部 URI 的 user 部分（GB28181 中即设备 ID）
    pub fn from_user(&self) -> Option<&str> {
        self.headers.get("From").map(extract_uri).and_then(uri_user)
    }

    /// 从字符串解析 SIP 请求
    pub fn from_string(s: &str) -> Result<Self> {
        let (head, raw_body) = split_head_body(s);
        let mut lines = head.split('\n');
        let request_line = lines
            .next()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Gb28181Error::Parse("Empty SIP message".to_string()))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("SIP/") {
            return Err(Gb28181Error::Parse(format!("Invalid request line: {}", request_line)));
        }
        let method = SipMethod::from_str(parts[0])
            .ok_or_else(|| Gb28181Error::Parse(format!("Unknown method: {}", parts[0])))?;

        let headers = parse_header_lines(lines)?;
        let body = parse_body(&headers, raw_body);

        Ok(Self {
            method,
            uri: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
            body,
        })
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, self.version)?;
        write_headers_and_body(f, &self.headers, &self.body)
    }
}

/// SIP 响应
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: SIP_VERSION.to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// 根据请求构造响应，复制 Via/From/To/Call-ID/CSeq
    pub fn from_request(req: &SipRequest, status_code: u16, reason_phrase: &str) -> Self {
        let mut resp = Self::new(status_code, reason_phrase);
        for (key, value) in req.headers.iter() {
            if name_eq(key, "Via")
                || name_eq(key, "From")
                || name_eq(key, "To")
                || name_eq(key, "Call-ID")
                || name_eq(key, "CSeq")
                || (name_eq(key, "Record-Route") && (101..300).contains(&status_code))
            {
                resp.headers.push(canonical_name(key), value);
            }
        }
        resp
    }

    /// 给 To 头部补上本地 tag
    pub fn with_to_tag(mut self, tag: &str) -> Self {
        self.headers.modify_first("To", |v| *v = with_tag(v, tag));
        self
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push(key, value);
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.headers.set("Content-Type", content_type);
        self.body = Some(body.into());
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// 从字符串解析 SIP 响应
    pub fn from_string(s: &str) -> Result<Self> {
        let (head, raw_body) = split_head_body(s);
        let mut lines = head.split('\n');
        let status_line = lines
            .next()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Gb28181Error::Parse("Empty SIP message".to_string()))?;

        let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
        if parts.len() < 2 {
            return Err(Gb28181Error::Parse(format!("Invalid status line: {}", status_line)));
        }
        let status_code = parts[1]
            .parse::<u16>()
            .map_err(|_| Gb28181Error::Parse(format!("Invalid status code: {}", parts[1])))?;

        let headers = parse_header_lines(lines)?;
        let body = parse_body(&headers, raw_body);

        Ok(Self {
            version: parts[0].to_string(),
            status_code,
            reason_phrase: parts.get(2).map(|s| s.to_string()).unwrap_or_default(),
            headers,
            body,
        })
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.version, self.status_code, self.reason_phrase)?;
        write_headers_and_body(f, &self.headers, &self.body)
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone, PartialEq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从字符串解析 SIP 消息
    pub fn from_string(s: &str) -> Result<Self> {
        let s = s.trim_start_matches(|c: char| c == '\r' || c == '\n');
        if s.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::from_string(s)?))
        } else {
            Ok(SipMessage::Request(SipRequest::from_string(s)?))
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(req) => &mut req.headers,
            SipMessage::Response(resp) => &mut resp.headers,
        }
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => req.fmt(f),
            SipMessage::Response(resp) => resp.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK1371463273\r\n\
        From: <sip:34020000001320000001@3402000000>;tag=2043466181\r\n\
        To: <sip:34020000001320000001@3402000000>\r\n\
        Call-ID: 1011047669@192.168.1.64\r\n\
        CSeq: 1 REGISTER\r\n\
        Contact: <sip:34020000001320000001@192.168.1.64:5060>\r\n\
        Max-Forwards: 70\r\n\
        Expires: 3600\r\n\
        Content-Length: 0\r\n\
        \r\n";

    #[test]
    fn test_sip_request_parsing() {
        let req = SipRequest::from_string(REGISTER).unwrap();

        assert_eq!(req.method, SipMethod::Register);
        assert_eq!(req.uri, "sip:34020000002000000001@3402000000");
        assert_eq!(req.headers.call_id(), Some("1011047669@192.168.1.64"));
        assert_eq!(req.headers.branch(), Some("z9hG4bK1371463273"));
        assert_eq!(req.headers.from_tag(), Some("2043466181"));
        assert_eq!(req.headers.to_tag(), None);
        assert_eq!(req.headers.expires(), Some(3600));
        assert_eq!(req.from_user(), Some("34020000001320000001"));
        let cseq = req.headers.cseq().unwrap();
        assert_eq!(cseq.seq, 1);
        assert_eq!(cseq.method, SipMethod::Register);
        assert!(req.body.is_none());
    }

    #[test]
    fn test_compact_headers_and_multi_via() {
        let raw = "MESSAGE sip:a@b SIP/2.0\r\n\
            v: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKtop\r\n\
            Via: SIP/2.0/UDP 10.0.0.3:5060;branch=z9hG4bKsecond, SIP/2.0/UDP 10.0.0.4;branch=z9hG4bKthird\r\n\
            i: abc\r\n\
            l: 5\r\n\
            \r\n\
            hello-trailing";
        let req = SipRequest::from_string(raw).unwrap();
        assert_eq!(req.headers.call_id(), Some("abc"));
        assert_eq!(req.headers.branch(), Some("z9hG4bKtop"));
        assert_eq!(req.headers.get_all("via").len(), 3);
        assert_eq!(req.body.as_deref(), Some("hello"));
    }

    #[test]
    fn test_request_serialization_recomputes_content_length() {
        let mut req = SipRequest::new(SipMethod::Message, "sip:34020000001320000001@3402000000");
        req.add_header("Content-Length", "999");
        req.set_body("Application/MANSCDP+xml", "<Query/>");
        let text = req.to_string();
        assert!(text.starts_with("MESSAGE sip:34020000001320000001@3402000000 SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 8\r\n\r\n<Query/>"));
        assert!(!text.contains("999"));
    }

    #[test]
    fn test_response_from_request() {
        let req = SipRequest::from_string(REGISTER).unwrap();
        let resp = SipResponse::from_request(&req, 200, "OK").with_to_tag("abcd");
        assert_eq!(resp.headers.to_tag(), Some("abcd"));
        assert_eq!(resp.headers.from_tag(), Some("2043466181"));
        assert_eq!(resp.headers.call_id(), req.headers.call_id());

        let parsed = SipMessage::from_string(&resp.to_string()).unwrap();
        match parsed {
            SipMessage::Response(r) => {
                assert_eq!(r.status_code, 200);
                assert_eq!(r.reason_phrase, "OK");
                assert_eq!(r.headers.branch(), Some("z9hG4bK1371463273"));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_header_set_replaces_all() {
        let mut headers = Headers::new();
        headers.push("Route", "<sip:a>");
        headers.push("Route", "<sip:b>");
        headers.set("Route", "<sip:c>");
        assert_eq!(headers.get_all("Route"), vec!["<sip:c>"]);
    }

    #[test]
    fn test_uri_helpers() {
        let value = "\"cam\" <sip:34020000001320000001@192.168.1.64:5060;transport=udp>;tag=99";
        let uri = extract_uri(value);
        assert_eq!(uri, "sip:34020000001320000001@192.168.1.64:5060;transport=udp");
        assert_eq!(uri_user(uri), Some("34020000001320000001"));
        assert_eq!(uri_host_port(uri), "192.168.1.64:5060");
        assert_eq!(header_param(value, "tag"), Some("99"));
        assert_eq!(header_param(value, "transport"), None);
        assert_eq!(with_tag("<sip:a@b>", "t1"), "<sip:a@b>;tag=t1");
    }

    #[test]
    fn test_invalid_messages() {
        assert!(SipMessage::from_string("").is_err());
        assert!(SipMessage::from_string("FOO sip:a SIP/2.0\r\n\r\n").is_err());
        assert!(SipMessage::from_string("SIP/2.0 abc OK\r\n\r\n").is_err());
    }
}
