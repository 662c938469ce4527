use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::capture::AddressFamily;

#[derive(Parser, Debug)]
#[command(
    name = "rawdisco",
    version,
    about = "Capture discovery packets on raw sockets with an in-kernel BPF filter"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Capture discovery packets and print one line per packet
    Listen(ListenArgs),
    /// Print the discovery filter programs without opening any socket
    DumpFilter(DumpFilterArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ListenArgs {
    /// Address families to capture [default: all]
    #[arg(long, default_value = "all")]
    pub family: FamilySelect,

    /// UDP port discovery packets are addressed to
    #[arg(long, value_parser = validate_port)]
    pub port: u16,

    /// UDP port for IPv6, when it differs from --port
    #[arg(long, value_parser = validate_port)]
    pub port6: Option<u16>,

    /// Stop after this many seconds; 0 runs until interrupted [default: 0]
    #[arg(long, default_value_t = 0, value_parser = validate_duration)]
    pub duration: u64,

    /// Behave as if raw capture were disabled by configuration
    #[arg(long)]
    pub disable: bool,
}

impl ListenArgs {
    /// The port accepted for `family`.
    pub fn port_for(&self, family: AddressFamily) -> u16 {
        match family {
            AddressFamily::V4 => self.port,
            AddressFamily::V6 => self.port6.unwrap_or(self.port),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DumpFilterArgs {
    /// Which programs to print [default: all]
    #[arg(long, default_value = "all")]
    pub family: FamilySelect,

    /// Output format [default: asm]
    #[arg(long, default_value = "asm")]
    pub format: FilterFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilySelect {
    Ip4,
    Ip6,
    All,
}

impl FamilySelect {
    pub fn families(self) -> Vec<AddressFamily> {
        match self {
            FamilySelect::Ip4 => vec![AddressFamily::V4],
            FamilySelect::Ip6 => vec![AddressFamily::V6],
            FamilySelect::All => vec![AddressFamily::V4, AddressFamily::V6],
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterFormat {
    /// tcpdump-style mnemonics
    Asm,
    /// `struct sock_filter` initializers
    C,
}

fn validate_port(s: &str) -> Result<u16, String> {
    let val: u16 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid port"))?;
    if val == 0 {
        Err("port must be between 1 and 65535".to_string())
    } else {
        Ok(val)
    }
}

fn validate_duration(s: &str) -> Result<u64, String> {
    let val: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val > 86_400 {
        Err("duration must be at most 86400 seconds".to_string())
    } else {
        Ok(val)
    }
}
