//! Kernel DPLL generic netlink family: wire codec and socket transport.
//!
//! Only the device subset is implemented: the `DEVICE_GET` dump and the
//! `monitor` multicast group carrying `DEVICE_{CREATE,CHANGE,DELETE}_NTF`.
//! Netlink headers and attributes are host endian.

use anyhow::{anyhow, bail, Result};
use byteorder::{ByteOrder, NativeEndian};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::status::DpllStatus;
use crate::traits::{DpllConnection, DpllTransport};

pub const DPLL_FAMILY_NAME: &str = "dpll";
pub const DPLL_FAMILY_VERSION: u8 = 1;
pub const DPLL_MCGRP_MONITOR: &str = "monitor";

// enum dpll_cmd
pub const DPLL_CMD_DEVICE_GET: u8 = 2;
pub const DPLL_CMD_DEVICE_CREATE_NTF: u8 = 4;
pub const DPLL_CMD_DEVICE_DELETE_NTF: u8 = 5;
pub const DPLL_CMD_DEVICE_CHANGE_NTF: u8 = 6;

// enum dpll_a
pub const DPLL_A_ID: u16 = 1;
pub const DPLL_A_MODULE_NAME: u16 = 2;
pub const DPLL_A_CLOCK_ID: u16 = 4;
pub const DPLL_A_MODE: u16 = 5;
pub const DPLL_A_LOCK_STATUS: u16 = 7;
pub const DPLL_A_TYPE: u16 = 9;

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_DUMP: u16 = 0x300;

const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;
const CTRL_ATTR_MCAST_GROUPS: u16 = 7;
const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpllType {
    Pps,
    Eec,
    Other(u32),
}

impl From<u32> for DpllType {
    fn from(raw: u32) -> Self {
        match raw {
            1 => DpllType::Pps,
            2 => DpllType::Eec,
            other => DpllType::Other(other),
        }
    }
}

impl fmt::Display for DpllType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpllType::Pps => f.write_str("pps"),
            DpllType::Eec => f.write_str("eec"),
            DpllType::Other(raw) => write!(f, "type-{}", raw),
        }
    }
}

/// One DPLL device as reported by a dump or a notification. Notifications
/// may omit attributes; missing ones stay zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceReply {
    pub id: u32,
    pub module_name: String,
    pub clock_id: u64,
    pub mode: u32,
    pub lock_status: u32,
    pub dpll_type: u32,
}

impl DeviceReply {
    pub fn kind(&self) -> DpllType {
        DpllType::from(self.dpll_type)
    }

    pub fn status(&self) -> DpllStatus {
        DpllStatus::from_code(i64::from(self.lock_status))
    }
}

impl fmt::Display for DeviceReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            1 => "manual".to_string(),
            2 => "automatic".to_string(),
            other => format!("mode-{}", other),
        };
        write!(
            f,
            "id {}, module {}, clock id {:#x}, type {}, mode {}, lock status {}",
            self.id,
            self.module_name,
            self.clock_id,
            self.kind(),
            mode,
            self.status()
        )
    }
}

// ============================================================================
// CODEC
// ============================================================================

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Builds one generic netlink request.
pub fn encode_request(
    family: u16,
    flags: u16,
    seq: u32,
    cmd: u8,
    version: u8,
    attrs: &[(u16, &[u8])],
) -> Vec<u8> {
    let mut payload = vec![cmd, version, 0, 0];
    for (kind, data) in attrs {
        let len = NLA_HDRLEN + data.len();
        payload.extend_from_slice(&(len as u16).to_ne_bytes());
        payload.extend_from_slice(&kind.to_ne_bytes());
        payload.extend_from_slice(data);
        payload.resize(align4(payload.len()), 0);
    }

    let total = NLMSG_HDRLEN + payload.len();
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&family.to_ne_bytes());
    msg.extend_from_slice(&flags.to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&payload);
    msg
}

#[derive(Debug)]
struct NlMessage<'a> {
    kind: u16,
    payload: &'a [u8],
}

fn split_messages(buf: &[u8]) -> Result<Vec<NlMessage<'_>>> {
    let mut out = Vec::new();
    let mut rest = buf;
    while rest.len() >= NLMSG_HDRLEN {
        let len = NativeEndian::read_u32(&rest[0..4]) as usize;
        if len < NLMSG_HDRLEN || len > rest.len() {
            bail!("malformed netlink message length {} ({} bytes left)", len, rest.len());
        }
        out.push(NlMessage {
            kind: NativeEndian::read_u16(&rest[4..6]),
            payload: &rest[NLMSG_HDRLEN..len],
        });
        rest = &rest[align4(len).min(rest.len())..];
    }
    Ok(out)
}

/// Splits an attribute stream. A truncated trailing attribute ends the walk.
fn split_attrs(buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    let mut rest = buf;
    while rest.len() >= NLA_HDRLEN {
        let len = NativeEndian::read_u16(&rest[0..2]) as usize;
        if len < NLA_HDRLEN || len > rest.len() {
            break;
        }
        let kind = NativeEndian::read_u16(&rest[2..4]) & NLA_TYPE_MASK;
        out.push((kind, &rest[NLA_HDRLEN..len]));
        rest = &rest[align4(len).min(rest.len())..];
    }
    out
}

fn attr_u32(data: &[u8]) -> Option<u32> {
    (data.len() >= 4).then(|| NativeEndian::read_u32(data))
}

fn attr_u64(data: &[u8]) -> Option<u64> {
    (data.len() >= 8).then(|| NativeEndian::read_u64(data))
}

fn attr_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn check_error(payload: &[u8]) -> Result<()> {
    if payload.len() < 4 {
        bail!("truncated netlink error message");
    }
    let code = NativeEndian::read_i32(&payload[0..4]);
    if code != 0 {
        let errno = std::io::Error::from_raw_os_error(-code);
        return Err(anyhow!("netlink error {}: {}", code, errno));
    }
    Ok(())
}

fn parse_device(attrs: &[u8]) -> DeviceReply {
    let mut reply = DeviceReply::default();
    for (kind, data) in split_attrs(attrs) {
        match kind {
            DPLL_A_ID => reply.id = attr_u32(data).unwrap_or_default(),
            DPLL_A_MODULE_NAME => reply.module_name = attr_string(data),
            DPLL_A_CLOCK_ID => reply.clock_id = attr_u64(data).unwrap_or_default(),
            DPLL_A_MODE => reply.mode = attr_u32(data).unwrap_or_default(),
            DPLL_A_LOCK_STATUS => reply.lock_status = attr_u32(data).unwrap_or_default(),
            DPLL_A_TYPE => reply.dpll_type = attr_u32(data).unwrap_or_default(),
            _ => {}
        }
    }
    reply
}

/// Device replies found in one receive buffer.
#[derive(Debug, Default)]
pub struct DeviceBatch {
    pub replies: Vec<DeviceReply>,
    /// The buffer contained the end-of-dump marker
    pub done: bool,
}

/// Decodes every DPLL device message of `family_id` in `buf`. Delete
/// notifications and foreign message types are skipped.
pub fn decode_device_batch(buf: &[u8], family_id: u16) -> Result<DeviceBatch> {
    let mut batch = DeviceBatch::default();
    for msg in split_messages(buf)? {
        match msg.kind {
            NLMSG_DONE => batch.done = true,
            NLMSG_ERROR => check_error(msg.payload)?,
            kind if kind == family_id => {
                if msg.payload.len() < GENL_HDRLEN {
                    continue;
                }
                match msg.payload[0] {
                    DPLL_CMD_DEVICE_GET
                    | DPLL_CMD_DEVICE_CREATE_NTF
                    | DPLL_CMD_DEVICE_CHANGE_NTF => {
                        batch.replies.push(parse_device(&msg.payload[GENL_HDRLEN..]));
                    }
                    // DEVICE_DELETE_NTF carries nothing to act on
                    _ => {}
                }
            }
            _ => {}
        }
    }
    Ok(batch)
}

/// Resolved id and multicast groups of a generic netlink family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyInfo {
    pub id: u16,
    pub groups: HashMap<String, u32>,
}

/// Decodes a `CTRL_CMD_GETFAMILY` reply buffer.
pub fn decode_family(buf: &[u8]) -> Result<Option<FamilyInfo>> {
    for msg in split_messages(buf)? {
        match msg.kind {
            NLMSG_ERROR => check_error(msg.payload)?,
            GENL_ID_CTRL if msg.payload.len() >= GENL_HDRLEN => {
                let mut info = FamilyInfo::default();
                for (kind, data) in split_attrs(&msg.payload[GENL_HDRLEN..]) {
                    match kind {
                        CTRL_ATTR_FAMILY_ID if data.len() >= 2 => {
                            info.id = NativeEndian::read_u16(data)
                        }
                        CTRL_ATTR_MCAST_GROUPS => {
                            for (_, group) in split_attrs(data) {
                                let mut name = None;
                                let mut id = None;
                                for (gk, gd) in split_attrs(group) {
                                    match gk {
                                        CTRL_ATTR_MCAST_GRP_NAME => name = Some(attr_string(gd)),
                                        CTRL_ATTR_MCAST_GRP_ID => id = attr_u32(gd),
                                        _ => {}
                                    }
                                }
                                if let (Some(name), Some(id)) = (name, id) {
                                    info.groups.insert(name, id);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                if info.id != 0 {
                    return Ok(Some(info));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Dials the kernel DPLL family over a raw `NETLINK_GENERIC` socket.
pub struct NetlinkTransport {
    recv_timeout: Duration,
}

impl NetlinkTransport {
    pub fn new(recv_timeout: Duration) -> Self {
        NetlinkTransport { recv_timeout }
    }
}

#[cfg(target_os = "linux")]
impl DpllTransport for NetlinkTransport {
    fn dial(&self) -> Result<Box<dyn DpllConnection>> {
        Ok(Box::new(linux::NetlinkConn::dial(self.recv_timeout)?))
    }
}

#[cfg(not(target_os = "linux"))]
impl DpllTransport for NetlinkTransport {
    fn dial(&self) -> Result<Box<dyn DpllConnection>> {
        let _ = self.recv_timeout;
        Err(anyhow!("DPLL netlink is only available on Linux"))
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use anyhow::Context;
    use nix::errno::Errno;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    const RECV_BUF_SIZE: usize = 64 * 1024;

    struct NetlinkSocket {
        fd: OwnedFd,
        seq: u32,
        buf: Vec<u8>,
    }

    impl NetlinkSocket {
        fn open(recv_timeout: Duration) -> Result<Self> {
            let raw = unsafe {
                libc::socket(
                    libc::AF_NETLINK,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                    libc::NETLINK_GENERIC,
                )
            };
            if raw < 0 {
                return Err(Errno::last()).context("failed to open generic netlink socket");
            }
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
            addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            let ret = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(Errno::last()).context("failed to bind netlink socket");
            }

            let tv = libc::timeval {
                tv_sec: recv_timeout.as_secs() as libc::time_t,
                tv_usec: recv_timeout.subsec_micros() as libc::suseconds_t,
            };
            let sock = NetlinkSocket { fd, seq: 0, buf: vec![0u8; RECV_BUF_SIZE] };
            sock.set_option(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
                .context("failed to set netlink receive timeout")?;
            Ok(sock)
        }

        fn set_option<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> Result<()> {
            let ret = unsafe {
                libc::setsockopt(
                    self.fd.as_raw_fd(),
                    level,
                    name,
                    value as *const T as *const libc::c_void,
                    mem::size_of::<T>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(Errno::last().into());
            }
            Ok(())
        }

        fn next_seq(&mut self) -> u32 {
            self.seq = self.seq.wrapping_add(1);
            self.seq
        }

        fn send(&self, msg: &[u8]) -> Result<()> {
            let ret = unsafe {
                libc::send(self.fd.as_raw_fd(), msg.as_ptr() as *const libc::c_void, msg.len(), 0)
            };
            if ret < 0 {
                return Err(Errno::last()).context("netlink send failed");
            }
            Ok(())
        }

        /// Ok(None) on receive timeout or signal interruption.
        fn recv(&mut self) -> Result<Option<&[u8]>> {
            let ret = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    0,
                )
            };
            if ret < 0 {
                return match Errno::last() {
                    Errno::EAGAIN | Errno::EINTR => Ok(None),
                    e => Err(e).context("netlink receive failed"),
                };
            }
            if ret == 0 {
                bail!("netlink socket closed");
            }
            Ok(Some(&self.buf[..ret as usize]))
        }
    }

    pub(super) struct NetlinkConn {
        sock: NetlinkSocket,
        family: FamilyInfo,
    }

    impl NetlinkConn {
        pub(super) fn dial(recv_timeout: Duration) -> Result<Self> {
            let mut sock = NetlinkSocket::open(recv_timeout)?;
            let seq = sock.next_seq();
            let mut name = DPLL_FAMILY_NAME.as_bytes().to_vec();
            name.push(0);
            let attrs = [(CTRL_ATTR_FAMILY_NAME, name.as_slice())];
            let req =
                encode_request(GENL_ID_CTRL, NLM_F_REQUEST, seq, CTRL_CMD_GETFAMILY, 1, &attrs);
            sock.send(&req)?;

            loop {
                let data = sock
                    .recv()?
                    .ok_or_else(|| anyhow!("timed out resolving {} family", DPLL_FAMILY_NAME))?;
                let family = decode_family(data).context("failed to resolve dpll family")?;
                if let Some(family) = family {
                    return Ok(NetlinkConn { sock, family });
                }
            }
        }
    }

    impl DpllConnection for NetlinkConn {
        fn dump_devices(&mut self) -> Result<Vec<DeviceReply>> {
            let seq = self.sock.next_seq();
            let req = encode_request(
                self.family.id,
                NLM_F_REQUEST | NLM_F_DUMP,
                seq,
                DPLL_CMD_DEVICE_GET,
                DPLL_FAMILY_VERSION,
                &[],
            );
            self.sock.send(&req)?;

            let family_id = self.family.id;
            let mut replies = Vec::new();
            loop {
                let data = self
                    .sock
                    .recv()?
                    .ok_or_else(|| anyhow!("timed out waiting for dpll device dump"))?;
                let batch = decode_device_batch(data, family_id)?;
                replies.extend(batch.replies);
                if batch.done {
                    return Ok(replies);
                }
            }
        }

        fn join_monitor_group(&mut self) -> Result<()> {
            let group = *self
                .family
                .groups
                .get(DPLL_MCGRP_MONITOR)
                .ok_or_else(|| anyhow!("multicast group {} not found", DPLL_MCGRP_MONITOR))?;
            self.sock
                .set_option(libc::SOL_NETLINK, libc::NETLINK_ADD_MEMBERSHIP, &group)
                .with_context(|| format!("failed to join multicast group {}", group))
        }

        fn receive(&mut self) -> Result<Option<Vec<DeviceReply>>> {
            let family_id = self.family.id;
            match self.sock.recv()? {
                Some(data) => Ok(Some(decode_device_batch(data, family_id)?.replies)),
                None => Ok(None),
            }
        }
    }
}
