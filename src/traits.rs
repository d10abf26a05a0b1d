use anyhow::Result;

use crate::netlink::DeviceReply;

/// Opens connections to the kernel DPLL status channel.
#[cfg_attr(test, mockall::automock)]
pub trait DpllTransport: Send + Sync {
    fn dial(&self) -> Result<Box<dyn DpllConnection>>;

    /// True if a connection can be established on this host.
    fn probe(&self) -> bool {
        self.dial().is_ok()
    }
}

/// One live connection. Dropping it closes the channel.
#[cfg_attr(test, mockall::automock)]
pub trait DpllConnection: Send {
    /// One-shot dump of every DPLL device known to the kernel.
    fn dump_devices(&mut self) -> Result<Vec<DeviceReply>>;

    /// Subscribes to unsolicited device change notifications.
    fn join_monitor_group(&mut self) -> Result<()>;

    /// Waits for the next notification batch. Returns Ok(None) when the
    /// receive timeout elapses without traffic.
    fn receive(&mut self) -> Result<Option<Vec<DeviceReply>>>;
}
