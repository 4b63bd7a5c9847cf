use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use rand::RngCore;

use crate::error::{Error, Result};

// Guest addresses live in 172.16.0.0/16; offset 1 is the bridge.
const IP_OFFSET_MIN: u32 = 2;
const IP_OFFSET_MAX: u32 = 65534;

/// Mint a fresh VM id: `vm-` + 12 lowercase hex chars.
pub fn mint_vm_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("vm-{}", hex::encode(bytes))
}

pub fn is_vm_id(candidate: &str) -> bool {
    match candidate.strip_prefix("vm-") {
        Some(suffix) => {
            suffix.len() == 12
                && suffix
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

/// TAP name derived from the id; 14 bytes, inside the kernel's 15-byte cap.
pub fn tap_device_for(vm_id: &str) -> String {
    let suffix = vm_id.strip_prefix("vm-").unwrap_or(vm_id);
    format!("tap-{}", &suffix[..suffix.len().min(10)])
}

/// Locally administered MAC: AA:FC + the first four bytes of the id.
pub fn mac_for(vm_id: &str) -> String {
    let suffix = vm_id.strip_prefix("vm-").unwrap_or(vm_id);
    let mut octets = [0u8; 4];
    for (i, octet) in octets.iter_mut().enumerate() {
        let chunk = suffix.get(i * 2..i * 2 + 2).unwrap_or("00");
        *octet = u8::from_str_radix(chunk, 16).unwrap_or(0);
    }
    format!(
        "AA:FC:{:02X}:{:02X}:{:02X}:{:02X}",
        octets[0], octets[1], octets[2], octets[3]
    )
}

pub fn socket_path_for(vm_id: &str) -> String {
    format!("/tmp/firecracker-{vm_id}.sock")
}

pub fn console_log_path_for(vm_id: &str) -> String {
    format!("/tmp/fc-{vm_id}-console.log")
}

/// Smallest-free allocator over guest IP offsets.
pub struct IpAllocator {
    used: BTreeSet<u32>,
}

impl IpAllocator {
    pub fn new() -> Self {
        Self {
            used: BTreeSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        for offset in IP_OFFSET_MIN..=IP_OFFSET_MAX {
            if self.used.insert(offset) {
                return Ok(ip_from_offset(offset));
            }
        }
        Err(Error::ResourceExhausted(
            "no free guest ip in 172.16.0.0/16".into(),
        ))
    }

    pub fn reserve(&mut self, ip: Ipv4Addr) {
        if let Some(offset) = offset_of(ip) {
            self.used.insert(offset);
        }
    }

    pub fn release(&mut self, ip: Ipv4Addr) {
        if let Some(offset) = offset_of(ip) {
            self.used.remove(&offset);
        }
    }
}

fn ip_from_offset(offset: u32) -> Ipv4Addr {
    Ipv4Addr::new(172, 16, (offset >> 8) as u8, (offset & 0xff) as u8)
}

fn offset_of(ip: Ipv4Addr) -> Option<u32> {
    let [a, b, c, d] = ip.octets();
    if (a, b) != (172, 16) {
        return None;
    }
    Some(u32::from(c) << 8 | u32::from(d))
}

/// Smallest-free allocator over the configured external port range.
pub struct PortAllocator {
    min: u16,
    max: u16,
    used: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            used: BTreeSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Result<u16> {
        for port in self.min..=self.max {
            if self.used.insert(port) {
                return Ok(port);
            }
        }
        Err(Error::ResourceExhausted(format!(
            "no free port in {}..{}",
            self.min, self.max
        )))
    }

    pub fn reserve(&mut self, port: u16) {
        self.used.insert(port);
    }

    pub fn release(&mut self, port: u16) {
        self.used.remove(&port);
    }
}

/// Allocator registries, mutated only under the creation lock.
pub struct Allocators {
    pub ips: std::sync::Mutex<IpAllocator>,
    pub ports: std::sync::Mutex<PortAllocator>,
}

impl Allocators {
    pub fn new(port_min: u16, port_max: u16) -> Self {
        Self {
            ips: std::sync::Mutex::new(IpAllocator::new()),
            ports: std::sync::Mutex::new(PortAllocator::new(port_min, port_max)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_have_expected_shape() {
        let id = mint_vm_id();
        assert!(is_vm_id(&id), "bad id: {id}");
        assert!(!is_vm_id("vm-XYZ"));
        assert!(!is_vm_id("vm-0123456789"));
        assert!(!is_vm_id("template-1"));
    }

    #[test]
    fn tap_and_mac_derive_from_id() {
        let id = "vm-a1b2c3d4e5f6";
        assert_eq!(tap_device_for(id), "tap-a1b2c3d4e5");
        assert!(tap_device_for(id).len() <= 15);
        assert_eq!(mac_for(id), "AA:FC:A1:B2:C3:D4");
        assert_eq!(socket_path_for(id), "/tmp/firecracker-vm-a1b2c3d4e5f6.sock");
    }

    #[test]
    fn ip_allocation_starts_at_offset_two_and_reuses_released() {
        let mut alloc = IpAllocator::new();
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 16, 0, 3));
        alloc.release(Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 16, 0, 2));
    }

    #[test]
    fn ip_reserve_blocks_allocation() {
        let mut alloc = IpAllocator::new();
        alloc.reserve(Ipv4Addr::new(172, 16, 0, 2));
        alloc.reserve(Ipv4Addr::new(172, 16, 0, 3));
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 16, 0, 4));
        // Out-of-subnet addresses are ignored rather than corrupting the pool.
        alloc.reserve(Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn ip_offsets_wrap_into_third_octet() {
        let mut alloc = IpAllocator::new();
        for _ in 0..255 {
            alloc.allocate().unwrap();
        }
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 16, 1, 1));
    }

    #[test]
    fn port_pool_exhausts_then_recovers_on_release() {
        let mut alloc = PortAllocator::new(22001, 22003);
        assert_eq!(alloc.allocate().unwrap(), 22001);
        assert_eq!(alloc.allocate().unwrap(), 22002);
        assert_eq!(alloc.allocate().unwrap(), 22003);
        assert!(matches!(
            alloc.allocate(),
            Err(Error::ResourceExhausted(_))
        ));
        alloc.release(22002);
        assert_eq!(alloc.allocate().unwrap(), 22002);
    }
}
