use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use rawdisco::bpf::filter;
use rawdisco::cli::{Cli, Command, DumpFilterArgs, FilterFormat, ListenArgs};
use rawdisco::disco;
use rawdisco::{AddressFamily, Config, DiscoError, DiscoHandler, NodePublic, RawCapture, RawDisco};

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

fn exit_code(err: &DiscoError) -> i32 {
    match err {
        DiscoError::ConfigurationDisabled => 1,
        DiscoError::CapabilityUnavailable(_)
        | DiscoError::CreateSocket(_)
        | DiscoError::InstallFilter(_) => 2,
        DiscoError::SelfTest(_) => 3,
        _ => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli)));

    match result {
        Ok(Ok(())) => std::process::exit(0),
        Ok(Err(e)) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
        Err(_) => {
            eprintln!("error: fatal: unexpected panic");
            std::process::exit(4);
        }
    }
}

fn run(cli: Cli) -> Result<(), DiscoError> {
    match cli.command {
        Command::Listen(args) => run_listen(&args),
        Command::DumpFilter(args) => run_dump_filter(&args),
    }
}

// ---------------------------------------------------------------------------
// Listen mode
// ---------------------------------------------------------------------------

/// One captured packet, queued for the output thread.
struct Captured {
    src: SocketAddr,
    len: usize,
    sender: Option<NodePublic>,
}

/// Stand-in for a real endpoint: fixed ports and a queue to stdout.
struct Endpoint {
    port4: AtomicU16,
    port6: AtomicU16,
    tx: Sender<Captured>,
}

impl DiscoHandler for Endpoint {
    fn bound_port(&self, family: AddressFamily) -> u16 {
        match family {
            AddressFamily::V4 => self.port4.load(Ordering::Relaxed),
            AddressFamily::V6 => self.port6.load(Ordering::Relaxed),
        }
    }

    fn handle_disco_message(&self, payload: &[u8], src: SocketAddr, sender: Option<NodePublic>) {
        let captured = Captured {
            src,
            len: payload.len(),
            sender: sender.or_else(|| disco::sender_key(payload)),
        };
        // Never block the receive thread on a slow stdout.
        match self.tx.try_send(captured) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::debug!("output queue full, dropping packet from {src}"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

fn run_listen(args: &ListenArgs) -> Result<(), DiscoError> {
    install_signal_handlers();

    let mut config = Config::from_env();
    if args.disable {
        config.disabled = true;
    }

    let (tx, rx) = bounded::<Captured>(1024);
    let endpoint = Arc::new(Endpoint {
        port4: AtomicU16::new(args.port_for(AddressFamily::V4)),
        port6: AtomicU16::new(args.port_for(AddressFamily::V6)),
        tx,
    });
    let raw = RawDisco::new(endpoint, config);

    let mut captures: Vec<RawCapture> = Vec::new();
    let mut first_err = None;
    for family in args.family.families() {
        match raw.start_capture(family.as_str()) {
            Ok(cap) => captures.push(cap),
            Err(e) => {
                log::warn!("raw disco {family} unavailable: {e}");
                first_err.get_or_insert(e);
            }
        }
    }
    if captures.is_empty() {
        return Err(first_err.unwrap_or(DiscoError::Closed));
    }

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let result = print_loop(&rx, deadline, &mut io::stdout().lock());

    for cap in &mut captures {
        if let Err(e) = cap.close() {
            log::debug!("closing {} capture: {e}", cap.family());
        }
    }

    let snap = raw.metrics().snapshot();
    log::info!(
        "raw disco received: ip4={} ip6={}",
        snap.recv_raw_ipv4,
        snap.recv_raw_ipv6
    );

    result
}

/// Print captured packets as TSV until shutdown, `deadline`, or a closed stdout.
fn print_loop(
    rx: &Receiver<Captured>,
    deadline: Option<Instant>,
    out: &mut impl Write,
) -> Result<(), DiscoError> {
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            return Ok(());
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(());
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(c) => match write_captured(out, &c) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
                Err(e) => return Err(DiscoError::Output(e)),
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn write_captured(out: &mut impl Write, c: &Captured) -> io::Result<()> {
    let family = if c.src.is_ipv4() { "ip4" } else { "ip6" };
    match c.sender {
        Some(key) => writeln!(out, "{family}\t{}\t{}\t{key}", c.src, c.len)?,
        None => writeln!(out, "{family}\t{}\t{}\t-", c.src, c.len)?,
    }
    out.flush()
}

// ---------------------------------------------------------------------------
// Filter dump
// ---------------------------------------------------------------------------

fn run_dump_filter(args: &DumpFilterArgs) -> Result<(), DiscoError> {
    let mut out = io::stdout().lock();
    for family in args.family.families() {
        let program = family.filter_program();
        let raw = filter::assemble(&program)?;
        write_program(&mut out, family, &program, &raw, args.format).map_err(DiscoError::Output)?;
    }
    Ok(())
}

fn write_program(
    out: &mut impl Write,
    family: AddressFamily,
    program: &[filter::Instruction],
    raw: &[filter::RawInstruction],
    format: FilterFormat,
) -> io::Result<()> {
    writeln!(out, "; {family}: {} instructions", program.len())?;
    match format {
        FilterFormat::Asm => {
            for (i, insn) in program.iter().enumerate() {
                writeln!(out, "({i:03}) {insn}")?;
            }
        }
        FilterFormat::C => {
            for insn in raw {
                writeln!(out, "{insn},")?;
            }
        }
    }
    out.flush()
}
