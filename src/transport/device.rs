//! The raw kernel character device: `ioctl`-based request/response/event
//! framing for `/dev/ipmidev/<n>`, `/dev/ipmi/<n>`, `/dev/ipmi<n>`.
//!
//! This module owns exactly the syscall surface; it knows nothing about
//! pending-command bookkeeping, discovery, or event fan-out. Those live in
//! [`super::connection`].

use std::{
  fmt, fs,
  io::{self, ErrorKind},
  os::unix::io::AsRawFd,
};

#[allow(unused_imports)]
use log::{debug, trace, warn};

use crate::{
  address::Address,
  config::Config,
  error::{Error, Result},
  message::{completion_code, Message, NetFn},
};

/// What kind of thing the kernel handed back from a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvType {
  Response,
  AsyncEvent,
  Cmd,
}

/// One raw read from the device: a classified message plus its source
/// address and the correlation token the kernel echoed back (for
/// `Response`) or assigned (for `Cmd`).
#[derive(Debug)]
pub struct RawRecv {
  pub recv_type: RecvType,
  pub addr: Address,
  pub msg_id: u64,
  pub message: Message,
}

mod ioctl {
  use super::*;
  use nix::{ioctl_read, ioctl_readwrite};

  const IPMI_IOC_MAGIC: u8 = b'i';

  #[repr(C)]
  pub struct RawIpmiAddr {
    pub addr_type: i32,
    pub channel: i16,
    pub data: [u8; 32],
  }

  #[repr(C)]
  pub struct RawMsg {
    pub netfn: u8,
    pub cmd: u8,
    pub data_len: u16,
    pub data: *mut u8,
  }

  #[repr(C)]
  pub struct RawRequest {
    pub addr: *mut u8,
    pub addr_len: u32,
    pub msgid: i64,
    pub msg: RawMsg,
  }

  #[repr(C)]
  pub struct RawReceive {
    pub recv_type: i32,
    pub addr: *mut u8,
    pub addr_len: u32,
    pub msgid: i64,
    pub msg: RawMsg,
  }

  #[repr(C)]
  pub struct RawCmdSpec {
    pub netfn: u8,
    pub cmd: u8,
    pub chans: i16,
  }

  pub const IPMI_RESPONSE_RECV_TYPE: i32 = 1;
  pub const IPMI_ASYNC_EVENT_RECV_TYPE: i32 = 2;
  pub const IPMI_CMD_RECV_TYPE: i32 = 3;

  ioctl_readwrite!(recv_msg_trunc, IPMI_IOC_MAGIC, 11, RawReceive);
  ioctl_read!(send_command, IPMI_IOC_MAGIC, 13, RawRequest);
  ioctl_readwrite!(register_for_cmd, IPMI_IOC_MAGIC, 14, RawCmdSpec);
  ioctl_readwrite!(unregister_for_cmd, IPMI_IOC_MAGIC, 15, RawCmdSpec);
  ioctl_read!(set_gets_events, IPMI_IOC_MAGIC, 16, u32);
  ioctl_read!(get_my_address, IPMI_IOC_MAGIC, 18, u32);
}

const IPMI_SYSTEM_INTERFACE_ADDR_TYPE: i32 = 0x0c;
const IPMI_IPMB_ADDR_TYPE: i32 = 0x01;
const IPMI_IPMB_BROADCAST_ADDR_TYPE: i32 = 0x41;
const IPMI_BMC_CHANNEL: i16 = 0xf;

fn to_raw_addr(addr: Address) -> ioctl::RawIpmiAddr {
  let mut data = [0u8; 32];
  match addr {
    Address::SystemInterface { .. } => ioctl::RawIpmiAddr {
      addr_type: IPMI_SYSTEM_INTERFACE_ADDR_TYPE,
      channel: IPMI_BMC_CHANNEL,
      data,
    },
    Address::Ipmb {
      channel,
      slave_addr,
      lun,
    } => {
      data[0] = slave_addr;
      data[1] = lun;
      ioctl::RawIpmiAddr {
        addr_type: IPMI_IPMB_ADDR_TYPE,
        channel: channel as i16,
        data,
      }
    }
    Address::IpmbBroadcast {
      channel,
      slave_addr,
      lun,
    } => {
      data[0] = slave_addr;
      data[1] = lun;
      ioctl::RawIpmiAddr {
        addr_type: IPMI_IPMB_BROADCAST_ADDR_TYPE,
        channel: channel as i16,
        data,
      }
    }
  }
}

fn from_raw_addr(raw: &ioctl::RawIpmiAddr) -> Address {
  match raw.addr_type {
    IPMI_IPMB_ADDR_TYPE => Address::Ipmb {
      channel: raw.channel as u8,
      slave_addr: raw.data[0],
      lun: raw.data[1],
    },
    IPMI_IPMB_BROADCAST_ADDR_TYPE => Address::IpmbBroadcast {
      channel: raw.channel as u8,
      slave_addr: raw.data[0],
      lun: raw.data[1],
    },
    _ => Address::SystemInterface {
      channel: raw.channel as u8,
    },
  }
}

/// The open handle to the kernel IPMI character device.
pub struct Device {
  file: fs::File,
}

impl fmt::Debug for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Device").field("fd", &self.file.as_raw_fd()).finish()
  }
}

impl Device {
  /// Try each candidate path in `config.device_paths`, in order, returning
  /// the first that opens. If none do, returns the last I/O error seen.
  pub fn open(config: &Config) -> Result<Self> {
    let mut last_err: Option<io::Error> = None;
    for path in &config.device_paths {
      match fs::OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => {
          debug!("opened IPMI character device at {path}");
          return Ok(Device { file });
        }
        Err(e) => {
          trace!("failed to open {path}: {e}");
          last_err = Some(e);
        }
      }
    }
    Err(last_err
      .map(Error::Io)
      .unwrap_or_else(|| Error::Io(io::Error::new(ErrorKind::NotFound, "no IPMI device path configured"))))
  }

  pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
    self.file.as_raw_fd()
  }

  pub fn my_address(&self) -> Result<u8> {
    let mut addr: u32 = 0;
    unsafe { ioctl::get_my_address(self.as_raw_fd(), &mut addr) }.map_err(io::Error::from)?;
    u8::try_from(addr)
      .map_err(|_| Error::Protocol(format!("IPMICTL_GET_MY_ADDRESS_CMD returned out-of-range {addr}")))
  }

  /// Write one request to the kernel, carrying `msg_id` as the
  /// correlation token the kernel echoes back with the matching response.
  pub fn send(&mut self, target: Address, msg: &Message, msg_id: u64) -> Result<()> {
    let mut raw_addr = to_raw_addr(target);
    let mut data = msg.data.clone();
    let raw_msg = ioctl::RawMsg {
      netfn: msg.netfn.raw(),
      cmd: msg.cmd,
      data_len: data.len() as u16,
      data: data.as_mut_ptr(),
    };
    let mut req = ioctl::RawRequest {
      addr: std::ptr::addr_of_mut!(raw_addr) as *mut u8,
      addr_len: std::mem::size_of::<ioctl::RawIpmiAddr>() as u32,
      msgid: msg_id as i64,
      msg: raw_msg,
    };

    trace!(
      "sending request netfn=0x{:02x} cmd=0x{:02x} to {:?} (id {})",
      msg.netfn.raw(),
      msg.cmd,
      target,
      msg_id
    );

    unsafe { ioctl::send_command(self.as_raw_fd(), &mut req) }.map_err(io::Error::from)?;
    // Keep `data` and `raw_addr` alive until after the ioctl has copied
    // out of them.
    drop(data);
    drop(raw_addr);
    Ok(())
  }

  /// Read one framed message: a response, an asynchronous event, or an
  /// incoming command. A payload too large for `buf` is reported by the
  /// kernel as a truncation error, which we convert into a synthetic
  /// response carrying `REQUESTED_DATA_LENGTH_EXCEEDED`.
  pub fn recv(&mut self) -> Result<RawRecv> {
    let mut addr = ioctl::RawIpmiAddr {
      addr_type: IPMI_SYSTEM_INTERFACE_ADDR_TYPE,
      channel: IPMI_BMC_CHANNEL,
      data: [0u8; 32],
    };
    let mut buf = [0u8; 1024];
    let mut raw = ioctl::RawReceive {
      recv_type: 0,
      addr: std::ptr::addr_of_mut!(addr) as *mut u8,
      addr_len: std::mem::size_of::<ioctl::RawIpmiAddr>() as u32,
      msgid: 0,
      msg: ioctl::RawMsg {
        netfn: 0,
        cmd: 0,
        data_len: buf.len() as u16,
        data: buf.as_mut_ptr(),
      },
    };

    let result = unsafe { ioctl::recv_msg_trunc(self.as_raw_fd(), &mut raw) };
    match result {
      Ok(_) => {}
      Err(nix::errno::Errno::EMSGSIZE) => {
        warn!("device reported a truncated receive; synthesizing REQUESTED_DATA_LENGTH_EXCEEDED");
        return Ok(RawRecv {
          recv_type: RecvType::Response,
          addr: from_raw_addr(&addr),
          msg_id: raw.msgid as u64,
          message: Message::response(
            NetFn::new(raw.msg.netfn).response(),
            raw.msg.cmd,
            vec![completion_code::REQUESTED_DATA_LENGTH_EXCEEDED],
          ),
        });
      }
      Err(e) => return Err(Error::Io(e.into())),
    }

    let recv_type = match raw.recv_type {
      ioctl::IPMI_RESPONSE_RECV_TYPE => RecvType::Response,
      ioctl::IPMI_ASYNC_EVENT_RECV_TYPE => RecvType::AsyncEvent,
      ioctl::IPMI_CMD_RECV_TYPE => RecvType::Cmd,
      other => {
        return Err(Error::Protocol(format!("unknown recv_type {other} from device")));
      }
    };

    let data_len = raw.msg.data_len as usize;
    let data = buf[..data_len].to_vec();
    let netfn = NetFn::new(raw.msg.netfn);
    let message = match recv_type {
      RecvType::Response => {
        if data.is_empty() {
          return Err(Error::Protocol("response shorter than the completion code byte".into()));
        }
        Message::response(netfn, raw.msg.cmd, data)
      }
      RecvType::AsyncEvent | RecvType::Cmd => Message::request(netfn, raw.msg.cmd, data),
    };

    Ok(RawRecv {
      recv_type,
      addr: from_raw_addr(&addr),
      msg_id: raw.msgid as u64,
      message,
    })
  }

  pub fn enable_events(&mut self, enabled: bool) -> Result<()> {
    let mut flag: u32 = enabled as u32;
    unsafe { ioctl::set_gets_events(self.as_raw_fd(), &mut flag) }.map_err(io::Error::from)?;
    Ok(())
  }

  pub fn register_for_cmd(&mut self, netfn: NetFn, cmd: u8) -> Result<()> {
    let mut spec = ioctl::RawCmdSpec {
      netfn: netfn.raw(),
      cmd,
      chans: -1,
    };
    unsafe { ioctl::register_for_cmd(self.as_raw_fd(), &mut spec) }.map_err(io::Error::from)?;
    Ok(())
  }

  pub fn unregister_for_cmd(&mut self, netfn: NetFn, cmd: u8) -> Result<()> {
    let mut spec = ioctl::RawCmdSpec {
      netfn: netfn.raw(),
      cmd,
      chans: -1,
    };
    unsafe { ioctl::unregister_for_cmd(self.as_raw_fd(), &mut spec) }.map_err(io::Error::from)?;
    Ok(())
  }
}
