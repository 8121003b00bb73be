// 对话存储：以 (Call-ID, local tag, remote tag) 为键
// 原始 INVITE 文本随对话持久化，重启后据此重建 BYE 等对话内请求

use super::endpoint::LocalIdentity;
use super::message::{extract_uri, new_branch, with_tag, CSeq, SipMethod, SipRequest, SipResponse};
use super::transport::{Destination, TransportKind};
use crate::store::{dialog, Store};
use crate::{Gb28181Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 对话用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DialogRole {
    Play,
    Playback,
    Download,
    Broadcast,
    Talk,
    SubscribeCatalog,
    SubscribeAlarm,
    SubscribePosition,
    SubscribePtz,
    Register,
}

impl DialogRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogRole::Play => "play",
            DialogRole::Playback => "playback",
            DialogRole::Download => "download",
            DialogRole::Broadcast => "broadcast",
            DialogRole::Talk => "talk",
            DialogRole::SubscribeCatalog => "subscribe-catalog",
            DialogRole::SubscribeAlarm => "subscribe-alarm",
            DialogRole::SubscribePosition => "subscribe-position",
            DialogRole::SubscribePtz => "subscribe-ptz",
            DialogRole::Register => "register",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "play" => DialogRole::Play,
            "playback" => DialogRole::Playback,
            "download" => DialogRole::Download,
            "broadcast" => DialogRole::Broadcast,
            "talk" => DialogRole::Talk,
            "subscribe-catalog" => DialogRole::SubscribeCatalog,
            "subscribe-alarm" => DialogRole::SubscribeAlarm,
            "subscribe-position" => DialogRole::SubscribePosition,
            "subscribe-ptz" => DialogRole::SubscribePtz,
            "register" => DialogRole::Register,
            _ => return None,
        })
    }

    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            DialogRole::SubscribeCatalog
                | DialogRole::SubscribeAlarm
                | DialogRole::SubscribePosition
                | DialogRole::SubscribePtz
        )
    }
}

impl fmt::Display for DialogRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    /// 收到的对话内请求：To tag 是本端，From tag 是对端
    pub fn from_incoming(req: &SipRequest) -> Option<Self> {
        Some(Self {
            call_id: req.headers.call_id()?.to_string(),
            local_tag: req.headers.to_tag()?.to_string(),
            remote_tag: req.headers.from_tag()?.to_string(),
        })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// 早期（18x 带 To tag）或已确认对话
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub role: DialogRole,
    pub is_uac: bool,
    pub device_id: String,
    pub local_seq: u32,
    pub remote_seq: u32,
    pub remote_target: String,
    pub route_set: Vec<String>,
    pub invite_raw: String,
    pub ack_raw: Option<String>,
    /// 仅收到 18x，尚未收到 2xx
    pub early: bool,
    pub destination: Destination,
    pub created_at: DateTime<Utc>,
}

impl Dialog {
    /// 本端发起（INVITE / SUBSCRIBE）收到带 To tag 的 18x 或 2xx 后建立
    pub fn from_uac_response(
        role: DialogRole,
        device_id: &str,
        request: &SipRequest,
        resp: &SipResponse,
        destination: Destination,
    ) -> Result<Self> {
        let call_id = request
            .headers
            .call_id()
            .ok_or_else(|| Gb28181Error::Parse("request without Call-ID".to_string()))?;
        let local_tag = request
            .headers
            .from_tag()
            .ok_or_else(|| Gb28181Error::Parse("request without From tag".to_string()))?;
        let remote_tag = resp
            .headers
            .to_tag()
            .ok_or_else(|| Gb28181Error::Parse(format!("{} without To tag", resp.status_code)))?;

        let remote_target = resp
            .headers
            .get("Contact")
            .map(|c| extract_uri(c).to_string())
            .unwrap_or_else(|| request.uri.clone());
        // UAC 的路由集为 Record-Route 逆序
        let mut route_set: Vec<String> = resp
            .headers
            .get_all("Record-Route")
            .into_iter()
            .map(str::to_string)
            .collect();
        route_set.reverse();

        Ok(Self {
            id: DialogId {
                call_id: call_id.to_string(),
                local_tag: local_tag.to_string(),
                remote_tag: remote_tag.to_string(),
            },
            role,
            is_uac: true,
            device_id: device_id.to_string(),
            local_seq: request.headers.cseq().map(|c| c.seq).unwrap_or(1),
            remote_seq: 0,
            remote_target,
            route_set,
            invite_raw: request.to_string(),
            ack_raw: None,
            early: resp.is_provisional(),
            destination,
            created_at: Utc::now(),
        })
    }

    /// 对端发起，本端以 local_tag 应答
    pub fn from_uas_request(
        role: DialogRole,
        device_id: &str,
        request: &SipRequest,
        local_tag: &str,
        source: Destination,
    ) -> Result<Self> {
        let call_id = request
            .headers
            .call_id()
            .ok_or_else(|| Gb28181Error::Parse("request without Call-ID".to_string()))?;
        let remote_tag = request
            .headers
            .from_tag()
            .ok_or_else(|| Gb28181Error::Parse("request without From tag".to_string()))?;
        let remote_target = request
            .headers
            .get("Contact")
            .map(|c| extract_uri(c).to_string())
            .or_else(|| request.headers.get("From").map(|f| extract_uri(f).to_string()))
            .unwrap_or_default();
        let route_set = request
            .headers
            .get_all("Record-Route")
            .into_iter()
            .map(str::to_string)
            .collect();

        Ok(Self {
            id: DialogId {
                call_id: call_id.to_string(),
                local_tag: local_tag.to_string(),
                remote_tag: remote_tag.to_string(),
            },
            role,
            is_uac: false,
            device_id: device_id.to_string(),
            local_seq: 0,
            remote_seq: request.headers.cseq().map(|c| c.seq).unwrap_or(0),
            remote_target,
            route_set,
            invite_raw: request.to_string(),
            ack_raw: None,
            early: false,
            destination: source,
            created_at: Utc::now(),
        })
    }

    fn invite(&self) -> Result<SipRequest> {
        SipRequest::from_string(&self.invite_raw)
    }

    /// 按当前 local_seq 构造对话内请求（不修改序号）
    pub fn build_request(&self, method: SipMethod, identity: &LocalIdentity) -> Result<SipRequest> {
        let invite = self.invite()?;
        let (from, to, contact) = if self.is_uac {
            (
                invite.headers.get("From").unwrap_or_default().to_string(),
                with_tag(invite.headers.get("To").unwrap_or_default(), &self.id.remote_tag),
                invite
                    .headers
                    .get("Contact")
                    .map(str::to_string)
                    .unwrap_or_else(|| identity.contact()),
            )
        } else {
            (
                with_tag(invite.headers.get("To").unwrap_or_default(), &self.id.local_tag),
                invite.headers.get("From").unwrap_or_default().to_string(),
                identity.contact(),
            )
        };

        let mut req = SipRequest::new(method, self.remote_target.clone());
        req.add_header("Via", identity.via(self.destination.transport, &new_branch()));
        for route in &self.route_set {
            req.add_header("Route", route.clone());
        }
        req.add_header("From", from);
        req.add_header("To", to);
        req.add_header("Call-ID", self.id.call_id.clone());
        req.add_header(
            "CSeq",
            CSeq {
                seq: self.local_seq,
                method,
            }
            .to_string(),
        );
        req.add_header("Max-Forwards", "70");
        req.add_header("Contact", contact);
        req.add_header("User-Agent", super::endpoint::USER_AGENT);
        Ok(req)
    }

    /// 2xx 的 ACK，CSeq 与 INVITE 相同
    pub fn build_ack(&self, identity: &LocalIdentity) -> Result<SipRequest> {
        let invite = self.invite()?;
        let seq = invite.headers.cseq().map(|c| c.seq).unwrap_or(self.local_seq);
        let mut acked = self.clone();
        acked.local_seq = seq;
        let mut ack = acked.build_request(SipMethod::Ack, identity)?;
        ack.headers.remove("Contact");
        Ok(ack)
    }
}

impl From<&Dialog> for dialog::Model {
    fn from(d: &Dialog) -> Self {
        dialog::Model {
            call_id: d.id.call_id.clone(),
            local_tag: d.id.local_tag.clone(),
            remote_tag: d.id.remote_tag.clone(),
            role: d.role.as_str().to_string(),
            device_id: d.device_id.clone(),
            is_uac: d.is_uac,
            local_seq: d.local_seq as i64,
            remote_seq: d.remote_seq as i64,
            remote_target: d.remote_target.clone(),
            route_set: serde_json::json!(d.route_set),
            invite_raw: d.invite_raw.clone(),
            ack_raw: d.ack_raw.clone(),
            early: d.early,
            transport: d.destination.transport.as_str().to_string(),
            remote_addr: d.destination.addr.to_string(),
            created_at: d.created_at,
        }
    }
}

impl TryFrom<dialog::Model> for Dialog {
    type Error = Gb28181Error;

    fn try_from(m: dialog::Model) -> Result<Self> {
        let role = DialogRole::from_str(&m.role)
            .ok_or_else(|| Gb28181Error::Parse(format!("unknown dialog role {}", m.role)))?;
        let addr = m
            .remote_addr
            .parse()
            .map_err(|_| Gb28181Error::Parse(format!("bad dialog address {}", m.remote_addr)))?;
        let transport = TransportKind::from_str(&m.transport).unwrap_or(TransportKind::Udp);
        let route_set: Vec<String> = serde_json::from_value(m.route_set)?;
        Ok(Self {
            id: DialogId {
                call_id: m.call_id,
                local_tag: m.local_tag,
                remote_tag: m.remote_tag,
            },
            role,
            is_uac: m.is_uac,
            device_id: m.device_id,
            local_seq: m.local_seq as u32,
            remote_seq: m.remote_seq as u32,
            remote_target: m.remote_target,
            route_set,
            invite_raw: m.invite_raw,
            ack_raw: m.ack_raw,
            early: m.early,
            destination: Destination { addr, transport },
            created_at: m.created_at,
        })
    }
}

/// 对话存储，写操作先落库再生效
pub struct DialogStore {
    dialogs: DashMap<DialogId, Dialog>,
    store: Option<Store>,
}

impl DialogStore {
    pub fn new(store: Option<Store>) -> Self {
        Self {
            dialogs: DashMap::new(),
            store,
        }
    }

    /// 启动时加载全部对话
    pub async fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut count = 0;
        for model in store.load_dialogs().await? {
            match Dialog::try_from(model) {
                Ok(d) => {
                    self.dialogs.insert(d.id.clone(), d);
                    count += 1;
                }
                Err(e) => tracing::warn!(target: "gb28181::store", "skip corrupt dialog row: {}", e),
            }
        }
        Ok(count)
    }

    pub async fn insert(&self, dialog: Dialog) -> Result<()> {
        // 每个设备最多一个 register 对话
        if dialog.role == DialogRole::Register {
            let stale: Vec<DialogId> = self
                .dialogs
                .iter()
                .filter(|d| {
                    d.role == DialogRole::Register && d.device_id == dialog.device_id && d.id != dialog.id
                })
                .map(|d| d.id.clone())
                .collect();
            for id in stale {
                self.remove(&id).await?;
            }
        }
        if let Some(store) = &self.store {
            store.save_dialog((&dialog).into()).await?;
        }
        tracing::debug!(target: "gb28181::sip", dialog = %dialog.id, role = %dialog.role, early = dialog.early, "dialog saved");
        self.dialogs.insert(dialog.id.clone(), dialog);
        Ok(())
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|d| d.clone())
    }

    pub fn contains(&self, id: &DialogId) -> bool {
        self.dialogs.contains_key(id)
    }

    /// 匹配收到的对话内请求
    pub fn find_for_request(&self, req: &SipRequest) -> Option<Dialog> {
        let id = DialogId::from_incoming(req)?;
        self.get(&id)
    }

    pub async fn remove(&self, id: &DialogId) -> Result<Option<Dialog>> {
        if let Some(store) = &self.store {
            store
                .delete_dialog(&id.call_id, &id.local_tag, &id.remote_tag)
                .await?;
        }
        Ok(self.dialogs.remove(id).map(|(_, d)| d))
    }

    /// 递增 local_seq 并构造对话内请求
    pub async fn next_request(
        &self,
        id: &DialogId,
        method: SipMethod,
        identity: &LocalIdentity,
    ) -> Result<(SipRequest, Destination)> {
        let snapshot = {
            let mut entry = self
                .dialogs
                .get_mut(id)
                .ok_or_else(|| Gb28181Error::NotFound(format!("dialog {}", id)))?;
            entry.local_seq += 1;
            entry.clone()
        };
        if let Some(store) = &self.store {
            store.save_dialog((&snapshot).into()).await?;
        }
        let req = snapshot.build_request(method, identity)?;
        Ok((req, snapshot.destination))
    }

    /// 记录发送过的 ACK，用于 INVITE 重传时原样重发
    pub async fn set_ack(&self, id: &DialogId, ack_raw: String) -> Result<()> {
        let snapshot = {
            let mut entry = self
                .dialogs
                .get_mut(id)
                .ok_or_else(|| Gb28181Error::NotFound(format!("dialog {}", id)))?;
            entry.ack_raw = Some(ack_raw);
            entry.clone()
        };
        if let Some(store) = &self.store {
            store.save_dialog((&snapshot).into()).await?;
        }
        Ok(())
    }

    /// 对端请求的 CSeq 只增不减
    pub fn observe_remote_seq(&self, id: &DialogId, seq: u32) -> bool {
        match self.dialogs.get_mut(id) {
            Some(mut d) if seq > d.remote_seq || d.remote_seq == 0 => {
                d.remote_seq = seq;
                true
            }
            Some(d) => seq == d.remote_seq,
            None => false,
        }
    }

    pub fn by_device(&self, device_id: &str) -> Vec<Dialog> {
        self.dialogs
            .iter()
            .filter(|d| d.device_id == device_id)
            .map(|d| d.clone())
            .collect()
    }

    pub fn by_call_id(&self, call_id: &str) -> Vec<Dialog> {
        self.dialogs
            .iter()
            .filter(|d| d.id.call_id == call_id)
            .map(|d| d.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Dialog> {
        self.dialogs.iter().map(|d| d.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> LocalIdentity {
        LocalIdentity {
            id: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            host: "192.168.1.10".to_string(),
            port: 5060,
        }
    }

    fn invite() -> SipRequest {
        let mut req = SipRequest::new(SipMethod::Invite, "sip:34020000001320000001@192.168.1.64:5060");
        req.add_header("Via", "SIP/2.0/UDP 192.168.1.10:5060;rport;branch=z9hG4bKinv1");
        req.add_header("From", "<sip:34020000002000000001@3402000000>;tag=local1");
        req.add_header("To", "<sip:34020000001320000001@3402000000>");
        req.add_header("Call-ID", "dlg-call-1");
        req.add_header("CSeq", "1 INVITE");
        req.add_header("Contact", "<sip:34020000002000000001@192.168.1.10:5060>");
        req.add_header("Subject", "34020000001320000001:0,34020000002000000001:0");
        req.set_body("APPLICATION/SDP", "v=0\r\n");
        req
    }

    fn ok_response(req: &SipRequest) -> SipResponse {
        let mut resp = SipResponse::from_request(req, 200, "OK").with_to_tag("remote1");
        resp.add_header("Contact", "<sip:34020000001320000001@192.168.1.64:5060;transport=udp>");
        resp.add_header("Record-Route", "<sip:10.0.0.1;lr>");
        resp.add_header("Record-Route", "<sip:10.0.0.2;lr>");
        resp
    }

    fn dest() -> Destination {
        Destination::udp("192.168.1.64:5060".parse().unwrap())
    }

    #[test]
    fn test_uac_bye_headers() {
        let req = invite();
        let d = Dialog::from_uac_response(DialogRole::Play, "34020000001320000001", &req, &ok_response(&req), dest())
            .unwrap();
        assert_eq!(d.route_set, vec!["<sip:10.0.0.2;lr>", "<sip:10.0.0.1;lr>"]);

        let mut d2 = d.clone();
        d2.local_seq += 1;
        let bye = d2.build_request(SipMethod::Bye, &identity()).unwrap();
        assert_eq!(bye.uri, "sip:34020000001320000001@192.168.1.64:5060;transport=udp");
        assert_eq!(bye.headers.get_all("Route"), vec!["<sip:10.0.0.2;lr>", "<sip:10.0.0.1;lr>"]);
        assert_eq!(bye.headers.from_tag(), Some("local1"));
        assert_eq!(bye.headers.to_tag(), Some("remote1"));
        assert_eq!(bye.headers.cseq().unwrap().seq, 2);

        let ack = d.build_ack(&identity()).unwrap();
        assert_eq!(ack.headers.cseq().unwrap().to_string(), "1 ACK");
    }

    #[test]
    fn test_uas_dialog_swaps_tags() {
        let mut req = invite();
        req.headers.remove("Contact");
        req.add_header("Contact", "<sip:34020000001320000001@192.168.1.64:5060>");
        let d = Dialog::from_uas_request(DialogRole::Talk, "34020000001320000001", &req, "mine", dest()).unwrap();
        assert_eq!(d.id.remote_tag, "local1");
        let bye = d.build_request(SipMethod::Bye, &identity()).unwrap();
        assert_eq!(bye.headers.from_tag(), Some("mine"));
        assert_eq!(bye.headers.to_tag(), Some("local1"));
        assert_eq!(bye.uri, "sip:34020000001320000001@192.168.1.64:5060");
    }

    #[tokio::test]
    async fn test_reloaded_dialog_builds_identical_bye() {
        let store = Store::memory().await.unwrap();
        let dialogs = DialogStore::new(Some(store.clone()));
        let req = invite();
        let d = Dialog::from_uac_response(DialogRole::Play, "34020000001320000001", &req, &ok_response(&req), dest())
            .unwrap();
        let id = d.id.clone();
        dialogs.insert(d).await.unwrap();

        let (before, _) = dialogs.next_request(&id, SipMethod::Bye, &identity()).await.unwrap();

        let reloaded = DialogStore::new(Some(store));
        assert_eq!(reloaded.load().await.unwrap(), 1);
        let after = reloaded.get(&id).unwrap().build_request(SipMethod::Bye, &identity()).unwrap();

        assert_eq!(before.uri, after.uri);
        for name in ["Route", "Contact", "From", "To", "Call-ID", "CSeq"] {
            assert_eq!(before.headers.get_all(name), after.headers.get_all(name), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_early_dialog_promoted_in_place() {
        let store = Store::memory().await.unwrap();
        let dialogs = DialogStore::new(Some(store.clone()));
        let req = invite();
        let ringing = SipResponse::from_request(&req, 183, "Session Progress").with_to_tag("remote1");
        let early = Dialog::from_uac_response(DialogRole::Play, "34020000001320000001", &req, &ringing, dest()).unwrap();
        assert!(early.early);
        dialogs.insert(early).await.unwrap();

        let reloaded = DialogStore::new(Some(store.clone()));
        reloaded.load().await.unwrap();
        assert!(reloaded.all()[0].early);

        let confirmed = Dialog::from_uac_response(DialogRole::Play, "34020000001320000001", &req, &ok_response(&req), dest())
            .unwrap();
        assert!(!confirmed.early);
        dialogs.insert(confirmed).await.unwrap();
        assert_eq!(dialogs.len(), 1);

        let reloaded = DialogStore::new(Some(store));
        assert_eq!(reloaded.load().await.unwrap(), 1);
        assert!(!reloaded.all()[0].early);

        let mut no_tag = SipResponse::from_request(&req, 180, "Ringing");
        no_tag.headers.remove("To");
        no_tag.add_header("To", "<sip:34020000001320000001@3402000000>");
        assert!(Dialog::from_uac_response(DialogRole::Play, "x", &req, &no_tag, dest()).is_err());
    }

    #[tokio::test]
    async fn test_single_register_dialog_per_device() {
        let dialogs = DialogStore::new(None);
        let req = invite();
        let mut a = Dialog::from_uac_response(DialogRole::Register, "34020000002000000009", &req, &ok_response(&req), dest())
            .unwrap();
        let mut b = a.clone();
        a.id.call_id = "reg-a".to_string();
        b.id.call_id = "reg-b".to_string();
        dialogs.insert(a).await.unwrap();
        dialogs.insert(b).await.unwrap();
        assert_eq!(dialogs.by_device("34020000002000000009").len(), 1);
        assert_eq!(dialogs.by_device("34020000002000000009")[0].id.call_id, "reg-b");
    }

    #[tokio::test]
    async fn test_remove_and_find() {
        let dialogs = DialogStore::new(None);
        let req = invite();
        let d = Dialog::from_uac_response(DialogRole::Play, "34020000001320000001", &req, &ok_response(&req), dest())
            .unwrap();
        let id = d.id.clone();
        dialogs.insert(d).await.unwrap();

        let mut bye = SipRequest::new(SipMethod::Bye, "sip:x@y");
        bye.add_header("From", "<sip:34020000001320000001@3402000000>;tag=remote1");
        bye.add_header("To", "<sip:34020000002000000001@3402000000>;tag=local1");
        bye.add_header("Call-ID", "dlg-call-1");
        assert!(dialogs.find_for_request(&bye).is_some());
        assert!(dialogs.remove(&id).await.unwrap().is_some());
        assert!(dialogs.find_for_request(&bye).is_none());
    }
}
