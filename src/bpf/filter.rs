//! Classic BPF program model for discovery packet matching.
//!
//! Programs are written as a sequence of [`Instruction`]s and validated by
//! [`assemble`] into [`RawInstruction`]s, the kernel's `struct sock_filter`
//! layout, ready for `SO_ATTACH_FILTER`. Two programs are provided:
//!
//! - [`discovery_filter_v4`]: for raw IPv4 sockets, which see the full IP header.
//! - [`discovery_filter_v6`]: for raw IPv6 sockets, which see only the UDP
//!   header onward.

use std::fmt;

use crate::disco::{DISCO_MAGIC1, DISCO_MAGIC2, UDP_HEADER_SIZE};

// ---------------------------------------------------------------------------
// FFI type: kernel filter instruction
// ---------------------------------------------------------------------------

/// A single assembled classic BPF instruction, matching the kernel
/// `struct sock_filter`.
///
/// The layout is:
/// - `code` (u16): opcode composed of class | size | mode
/// - `jt`   (u8):  jump-true offset (relative, for conditional jumps)
/// - `jf`   (u8):  jump-false offset (relative, for conditional jumps)
/// - `k`    (u32): generic constant (immediate value, packet offset, etc.)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

// Compile-time size assertion: must match the kernel's 8-byte sock_filter.
const _: () = assert!(std::mem::size_of::<RawInstruction>() == 8);

impl fmt::Display for RawInstruction {
    /// Formats in `tcpdump -dd` style.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ 0x{:02x}, {}, {}, 0x{:08x} }}",
            self.code, self.jt, self.jf, self.k
        )
    }
}

// ---------------------------------------------------------------------------
// BPF instruction constants
// ---------------------------------------------------------------------------

// Instruction classes
const BPF_LD: u16 = 0x00;
const BPF_LDX: u16 = 0x01;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// LD/LDX sizes
const BPF_W: u16 = 0x00; // word (32-bit)
const BPF_H: u16 = 0x08; // half-word (16-bit)
const BPF_B: u16 = 0x10; // byte

// LD/LDX modes
const BPF_ABS: u16 = 0x20; // absolute offset into packet
const BPF_IND: u16 = 0x40; // indirect offset (X + k)
const BPF_MSH: u16 = 0xa0; // IP header length hack: 4*(data[k] & 0xf)

// JMP operations
const BPF_JEQ: u16 = 0x10; // jump if A == k
const BPF_JSET: u16 = 0x40; // jump if A & k != 0

// Operand source
const BPF_K: u16 = 0x00;

/// Longest program the kernel accepts (`BPF_MAXINSNS`).
pub const MAX_INSTRUCTIONS: usize = 4096;

/// Return value that accepts the whole packet.
pub const ACCEPT_ALL: u32 = 0xFFFF_FFFF;

// IPv4 flags + fragment offset field.
const IPV4_FRAG_FIELD_OFFSET: u32 = 6;
const IPV4_MORE_FRAGMENTS: u32 = 0x2000;
const IPV4_FRAGMENT_OFFSET_MASK: u32 = 0x1fff;

// ---------------------------------------------------------------------------
// Program model
// ---------------------------------------------------------------------------

/// Comparison performed by [`Instruction::JumpIf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTest {
    /// `A == val`
    Equal,
    /// `A & val != 0`
    BitsSet,
}

/// One step of a loop-free filter program.
///
/// Loads read big-endian values of `size` bytes (1, 2 or 4). Jumps skip
/// forward only, counted from the following instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// `A = packet[off..off + size]`
    LoadAbsolute { off: u32, size: u8 },
    /// `A = packet[X + off..X + off + size]`
    LoadIndirect { off: u32, size: u8 },
    /// `X = 4 * (packet[off] & 0x0f)`, the IPv4 header length.
    LoadMemShift { off: u32 },
    /// Skip `skip_true` or `skip_false` instructions depending on `cond`.
    JumpIf {
        cond: JumpTest,
        val: u32,
        skip_true: u8,
        skip_false: u8,
    },
    /// Stop; zero drops the packet, anything else accepts it.
    RetConstant { val: u32 },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instruction::LoadAbsolute { off, size } => {
                write!(f, "ld{} [{}]", size_suffix(size), off)
            }
            Instruction::LoadIndirect { off, size } => {
                write!(f, "ld{} [x+{}]", size_suffix(size), off)
            }
            Instruction::LoadMemShift { off } => write!(f, "ldxb 4*([{}]&0xf)", off),
            Instruction::JumpIf {
                cond,
                val,
                skip_true,
                skip_false,
            } => {
                let op = match cond {
                    JumpTest::Equal => "jeq",
                    JumpTest::BitsSet => "jset",
                };
                write!(f, "{op} #0x{val:x} jt {skip_true} jf {skip_false}")
            }
            Instruction::RetConstant { val } => write!(f, "ret #0x{val:x}"),
        }
    }
}

fn size_suffix(size: u8) -> &'static str {
    match size {
        1 => "b",
        2 => "h",
        _ => "",
    }
}

/// Reasons a program cannot be turned into kernel instructions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("empty filter program")]
    Empty,
    #[error("filter program has {len} instructions (max {max})")]
    TooLong { len: usize, max: usize },
    #[error("instruction {index}: invalid load size {size}")]
    InvalidLoadSize { index: usize, size: u8 },
    #[error("instruction {index}: jump by {skip} leaves the program")]
    JumpOutOfRange { index: usize, skip: u8 },
    #[error("filter program does not end in a return")]
    MissingReturn,
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> RawInstruction {
    RawInstruction { code, jt, jf, k }
}

fn load_size(index: usize, size: u8) -> Result<u16, AssemblyError> {
    match size {
        1 => Ok(BPF_B),
        2 => Ok(BPF_H),
        4 => Ok(BPF_W),
        _ => Err(AssemblyError::InvalidLoadSize { index, size }),
    }
}

/// Validate `program` and encode it as kernel instructions.
///
/// Every jump target must lie inside the program and the last instruction
/// must be a return, so evaluation always terminates on a `ret`.
pub fn assemble(program: &[Instruction]) -> Result<Vec<RawInstruction>, AssemblyError> {
    if program.is_empty() {
        return Err(AssemblyError::Empty);
    }
    if program.len() > MAX_INSTRUCTIONS {
        return Err(AssemblyError::TooLong {
            len: program.len(),
            max: MAX_INSTRUCTIONS,
        });
    }

    let mut out = Vec::with_capacity(program.len());
    for (index, instruction) in program.iter().enumerate() {
        // Instructions left after this one; a skip must stay below it.
        let remaining = program.len() - index - 1;
        let raw = match *instruction {
            Instruction::LoadAbsolute { off, size } => {
                insn(BPF_LD | load_size(index, size)? | BPF_ABS, 0, 0, off)
            }
            Instruction::LoadIndirect { off, size } => {
                insn(BPF_LD | load_size(index, size)? | BPF_IND, 0, 0, off)
            }
            Instruction::LoadMemShift { off } => insn(BPF_LDX | BPF_B | BPF_MSH, 0, 0, off),
            Instruction::JumpIf {
                cond,
                val,
                skip_true,
                skip_false,
            } => {
                for skip in [skip_true, skip_false] {
                    if usize::from(skip) >= remaining {
                        return Err(AssemblyError::JumpOutOfRange { index, skip });
                    }
                }
                let op = match cond {
                    JumpTest::Equal => BPF_JEQ,
                    JumpTest::BitsSet => BPF_JSET,
                };
                insn(BPF_JMP | op | BPF_K, skip_true, skip_false, val)
            }
            Instruction::RetConstant { val } => insn(BPF_RET | BPF_K, 0, 0, val),
        };
        out.push(raw);
    }

    if !matches!(program.last(), Some(Instruction::RetConstant { .. })) {
        return Err(AssemblyError::MissingReturn);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Discovery filters
// ---------------------------------------------------------------------------

/// Filter for raw IPv4 UDP sockets, which receive the entire IP packet.
///
/// Discovery packets are small enough never to be fragmented, so any
/// fragment (MF set, or a trailing fragment with a non-zero offset) is
/// dropped instead of reassembled. The IP header length is variable, so the
/// marker is read relative to X.
///
/// Equivalent pseudo-assembly:
/// ```text
///   [0]  ldh  [6]                    ; flags + fragment offset
///   [1]  jset #0x2000  jt 7 jf 0     ; more fragments -> [9] drop
///   [2]  jset #0x1fff  jt 6 jf 0     ; non-zero offset -> [9] drop
///   [3]  ldxb 4*([0]&0xf)            ; X = IP header length
///   [4]  ld   [x+8]                  ; first 4 marker bytes
///   [5]  jeq  #MAGIC1  jt 0 jf 3     ; mismatch -> [9] drop
///   [6]  ldh  [x+12]                 ; next 2 marker bytes
///   [7]  jeq  #MAGIC2  jt 0 jf 1     ; mismatch -> [9] drop
///   [8]  ret  #0xffffffff            ; accept
///   [9]  ret  #0                     ; drop
/// ```
pub fn discovery_filter_v4() -> Vec<Instruction> {
    let udp = UDP_HEADER_SIZE as u32;
    vec![
        Instruction::LoadAbsolute {
            off: IPV4_FRAG_FIELD_OFFSET,
            size: 2,
        },
        Instruction::JumpIf {
            cond: JumpTest::BitsSet,
            val: IPV4_MORE_FRAGMENTS,
            skip_true: 7,
            skip_false: 0,
        },
        Instruction::JumpIf {
            cond: JumpTest::BitsSet,
            val: IPV4_FRAGMENT_OFFSET_MASK,
            skip_true: 6,
            skip_false: 0,
        },
        Instruction::LoadMemShift { off: 0 },
        Instruction::LoadIndirect { off: udp, size: 4 },
        Instruction::JumpIf {
            cond: JumpTest::Equal,
            val: DISCO_MAGIC1,
            skip_true: 0,
            skip_false: 3,
        },
        Instruction::LoadIndirect {
            off: udp + 4,
            size: 2,
        },
        Instruction::JumpIf {
            cond: JumpTest::Equal,
            val: u32::from(DISCO_MAGIC2),
            skip_true: 0,
            skip_false: 1,
        },
        Instruction::RetConstant { val: ACCEPT_ALL },
        Instruction::RetConstant { val: 0 },
    ]
}

/// Filter for raw IPv6 UDP sockets.
///
/// Unlike IPv4, a raw IPv6 socket's filter sees only the UDP header onward,
/// so the marker sits at a fixed offset. Packets carrying extension headers
/// never reach the filter in this shape and are not matched; classic BPF
/// cannot loop over a header chain, and that false negative is accepted.
///
/// Equivalent pseudo-assembly:
/// ```text
///   [0]  ld   [8]                    ; first 4 marker bytes
///   [1]  jeq  #MAGIC1  jt 0 jf 3
///   [2]  ldh  [12]                   ; next 2 marker bytes
///   [3]  jeq  #MAGIC2  jt 0 jf 1
///   [4]  ret  #0xffffffff            ; accept
///   [5]  ret  #0                     ; drop
/// ```
pub fn discovery_filter_v6() -> Vec<Instruction> {
    let udp = UDP_HEADER_SIZE as u32;
    vec![
        Instruction::LoadAbsolute { off: udp, size: 4 },
        Instruction::JumpIf {
            cond: JumpTest::Equal,
            val: DISCO_MAGIC1,
            skip_true: 0,
            skip_false: 3,
        },
        Instruction::LoadAbsolute {
            off: udp + 4,
            size: 2,
        },
        Instruction::JumpIf {
            cond: JumpTest::Equal,
            val: u32::from(DISCO_MAGIC2),
            skip_true: 0,
            skip_false: 1,
        },
        Instruction::RetConstant { val: ACCEPT_ALL },
        Instruction::RetConstant { val: 0 },
    ]
}

// ===========================================================================
// Tests
// ===========================================================================
