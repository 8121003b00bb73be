// SSRC 分配
// 10 位十进制：首位 0 实时 / 1 历史，中间 8 位为设备编码低 8 位，末位为递增计数
// 同一设备同类型占满 10 个槽位后，改用全局递增的 9 位后缀

use super::stream_id::InviteKind;
use crate::{Gb28181Error, Result};
use dashmap::DashSet;
use std::sync::atomic::{AtomicU32, Ordering};

const SUFFIX_MOD: u64 = 1_000_000_000;
const DEVICE_SLOTS: u64 = 10;

#[derive(Default)]
pub struct SsrcAllocator {
    counter: AtomicU32,
    overflow: AtomicU32,
    in_use: DashSet<String>,
}

fn prefix(kind: InviteKind) -> char {
    match kind {
        InviteKind::Playback | InviteKind::Download => '1',
        _ => '0',
    }
}

fn device_low8(device_id: &str) -> u64 {
    let digits: String = device_id.chars().filter(|c| c.is_ascii_digit()).collect();
    let start = digits.len().saturating_sub(8);
    digits[start..].parse().unwrap_or(0)
}

impl SsrcAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配一个未被占用的 SSRC
    pub fn allocate(&self, kind: InviteKind, device_id: &str) -> String {
        let low8 = device_low8(device_id);
        let start = self.counter.fetch_add(1, Ordering::Relaxed) as u64;
        for i in 0..DEVICE_SLOTS {
            let ssrc = format!("{}{:08}{}", prefix(kind), low8, (start + i) % DEVICE_SLOTS);
            if self.in_use.insert(ssrc.clone()) {
                return ssrc;
            }
        }
        loop {
            let n = self.overflow.fetch_add(1, Ordering::Relaxed) as u64;
            let ssrc = format!("{}{:09}", prefix(kind), n % SUFFIX_MOD);
            if self.in_use.insert(ssrc.clone()) {
                return ssrc;
            }
        }
    }

    /// 登记调用方指定的 SSRC
    pub fn reserve(&self, ssrc: &str) -> Result<()> {
        if ssrc.len() != 10 || !ssrc.chars().all(|c| c.is_ascii_digit()) {
            return Err(Gb28181Error::Parse(format!("SSRC must be 10 decimal digits: {}", ssrc)));
        }
        if !self.in_use.insert(ssrc.to_string()) {
            return Err(Gb28181Error::Duplicate(format!("SSRC {} in use", ssrc)));
        }
        Ok(())
    }

    pub fn release(&self, ssrc: &str) {
        self.in_use.remove(ssrc);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_length() {
        let alloc = SsrcAllocator::new();
        let live = alloc.allocate(InviteKind::Play, "34020000001320000001");
        let hist = alloc.allocate(InviteKind::Playback, "34020000001320000001");
        assert_eq!(live.len(), 10);
        assert!(live.starts_with('0'));
        assert!(hist.starts_with('1'));
        assert!(alloc.allocate(InviteKind::Download, "x").starts_with('1'));
        // 低 8 位 20000001 出现在后缀中
        assert_eq!(&live[1..9], "20000001");
    }

    #[test]
    fn test_device_slots_wrap_around() {
        let alloc = SsrcAllocator::new();
        let device = "34020000001320000001";
        let first: Vec<String> = (0..10).map(|_| alloc.allocate(InviteKind::Play, device)).collect();
        for ssrc in &first {
            assert_eq!(&ssrc[..9], "020000001");
        }
        let digits: std::collections::HashSet<_> = first.iter().map(|s| &s[9..]).collect();
        assert_eq!(digits.len(), 10);

        // 槽位用尽后仍唯一
        let extra: Vec<String> = (0..15).map(|_| alloc.allocate(InviteKind::Play, device)).collect();
        let mut all: std::collections::HashSet<_> = first.iter().cloned().collect();
        for ssrc in &extra {
            assert_eq!(ssrc.len(), 10);
            assert!(ssrc.starts_with('0'));
            assert!(all.insert(ssrc.clone()));
        }

        // 释放后重新落回设备槽位
        alloc.release(&first[3]);
        assert_eq!(alloc.allocate(InviteKind::Play, device), first[3]);

        // 其他设备、其他类型不受影响
        assert_eq!(&alloc.allocate(InviteKind::Playback, device)[..9], "120000001");
        assert_eq!(&alloc.allocate(InviteKind::Play, "34020000001320000002")[1..9], "20000002");
    }

    #[test]
    fn test_unique_until_released() {
        let alloc = SsrcAllocator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(alloc.allocate(InviteKind::Play, "34020000001320000001")));
        }
        assert_eq!(alloc.in_use(), 100);

        let fixed = "0123456789";
        alloc.reserve(fixed).unwrap();
        assert_eq!(alloc.reserve(fixed).unwrap_err().kind(), crate::ErrorKind::Duplicate);
        alloc.release(fixed);
        alloc.reserve(fixed).unwrap();
        assert!(alloc.reserve("12345").is_err());
        assert!(alloc.reserve("01234abcde").is_err());
    }
}
