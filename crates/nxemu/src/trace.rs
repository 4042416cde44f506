//! Text traces of guest memory and GPU activity, replayed against a [`Gpu`].
//!
//! One directive per line; `#` starts a comment. Numbers are hex (`0x..`) or
//! decimal.
//!
//! ```text
//! map_cpu 0x100000 0x200000 0x80000000
//! map_gpu 0x100000 0x100000000 0x200000
//! write32 0x100000 0xdeadbeef
//! expect32 0x100000 0xdeadbeef
//! ```

use crate::args::parse_hex_or_dec;
use crate::backend::GraphicsBackend;
use crate::engines::maxwell_3d::{ClearBuffers, RenderTargetConfig};
use crate::error::TraceError;
use crate::gpu::Gpu;
use crate::rasterizer::{FramebufferConfig, RasterizerInterface};
use oxidinx_hw::mmio::fermi_2d::NUM_REGS;
use oxidinx_hw::specs::render_targets::NUM_COLOR;
use oxidinx_hw::specs::syncpoints::MAX_SYNCPOINTS;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    U8,
    U16,
    U32,
    U64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    MapCpu { base: u64, size: u64, target: u64 },
    UnmapCpu { base: u64, size: u64 },
    MapGpu { cpu_addr: u64, gpu_addr: u64, size: u64 },
    MapGpuAlloc { cpu_addr: u64, size: u64, align: u64 },
    UnmapGpu { gpu_addr: u64, size: u64 },
    Write { width: AccessWidth, addr: u64, value: u64 },
    Read { width: AccessWidth, addr: u64 },
    Expect32 { addr: u64, value: u32 },
    Fill { addr: u64, size: u64, byte: u8 },
    /// 2D engine method call
    Method { register: u32, value: u32 },
    Flush,
    Finish,
    TickFrame,
    Semaphore { gpu_addr: u64, value: u32 },
    Syncpoint { id: u32 },
    Flip { cpu_addr: u64, width: u32, height: u32, stride: u32, format: u32 },
    RenderTarget { index: usize, gpu_addr: u64, width: u32, height: u32, format: u32, tiled: bool },
    /// Clear render target 0 to a packed RGBA8 color
    Clear { color: u32 },
    Draw,
}

/// What a replay did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub directives: usize,
    pub expectations: usize,
    pub reads: usize,
    pub methods: usize,
    pub flips: usize,
    pub draws: usize,
}

// ================================================================================================
// Parsing
// ================================================================================================

struct Tokens<'a> {
    line: usize,
    name: &'a str,
    args: Vec<&'a str>,
}

impl Tokens<'_> {
    fn error(&self, message: impl Into<String>) -> TraceError {
        TraceError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn expect_args(&self, min: usize, max: usize) -> Result<(), TraceError> {
        if self.args.len() < min || self.args.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{min} to {max}")
            };
            return Err(self.error(format!(
                "{} takes {} argument(s), got {}",
                self.name,
                expected,
                self.args.len()
            )));
        }
        Ok(())
    }

    fn num(&self, index: usize) -> Result<u64, TraceError> {
        let token = self.args[index];
        parse_hex_or_dec(token).map_err(|err| self.error(format!("bad number '{token}': {err}")))
    }

    fn num32(&self, index: usize) -> Result<u32, TraceError> {
        let value = self.num(index)?;
        u32::try_from(value).map_err(|_| self.error(format!("{value:#x} does not fit in 32 bits")))
    }
}

fn width_of(name: &str) -> Option<AccessWidth> {
    match name {
        "8" => Some(AccessWidth::U8),
        "16" => Some(AccessWidth::U16),
        "32" => Some(AccessWidth::U32),
        "64" => Some(AccessWidth::U64),
        _ => None,
    }
}

/// Parse one line, returning `None` for blank lines and comments.
pub fn parse_line(line: usize, text: &str) -> Result<Option<Directive>, TraceError> {
    let text = text.split('#').next().unwrap_or_default().trim();
    let mut words = text.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let t = Tokens {
        line,
        name,
        args: words.collect(),
    };

    let directive = match name {
        "map_cpu" => {
            t.expect_args(3, 3)?;
            Directive::MapCpu {
                base: t.num(0)?,
                size: t.num(1)?,
                target: t.num(2)?,
            }
        }
        "unmap_cpu" => {
            t.expect_args(2, 2)?;
            Directive::UnmapCpu {
                base: t.num(0)?,
                size: t.num(1)?,
            }
        }
        "map_gpu" => {
            t.expect_args(3, 3)?;
            Directive::MapGpu {
                cpu_addr: t.num(0)?,
                gpu_addr: t.num(1)?,
                size: t.num(2)?,
            }
        }
        "map_gpu_alloc" => {
            t.expect_args(2, 3)?;
            Directive::MapGpuAlloc {
                cpu_addr: t.num(0)?,
                size: t.num(1)?,
                align: if t.args.len() == 3 { t.num(2)? } else { 0 },
            }
        }
        "unmap_gpu" => {
            t.expect_args(2, 2)?;
            Directive::UnmapGpu {
                gpu_addr: t.num(0)?,
                size: t.num(1)?,
            }
        }
        "expect32" => {
            t.expect_args(2, 2)?;
            Directive::Expect32 {
                addr: t.num(0)?,
                value: t.num32(1)?,
            }
        }
        "fill" => {
            t.expect_args(3, 3)?;
            let byte = t.num(2)?;
            Directive::Fill {
                addr: t.num(0)?,
                size: t.num(1)?,
                byte: u8::try_from(byte).map_err(|_| t.error(format!("{byte:#x} is not a byte")))?,
            }
        }
        "method" => {
            t.expect_args(2, 2)?;
            let register = t.num32(0)?;
            if register as usize >= NUM_REGS {
                return Err(t.error(format!("2D engine register {register:#x} out of range")));
            }
            Directive::Method {
                register,
                value: t.num32(1)?,
            }
        }
        "flush" => {
            t.expect_args(0, 0)?;
            Directive::Flush
        }
        "finish" => {
            t.expect_args(0, 0)?;
            Directive::Finish
        }
        "tick_frame" => {
            t.expect_args(0, 0)?;
            Directive::TickFrame
        }
        "semaphore" => {
            t.expect_args(2, 2)?;
            Directive::Semaphore {
                gpu_addr: t.num(0)?,
                value: t.num32(1)?,
            }
        }
        "syncpoint" => {
            t.expect_args(1, 1)?;
            let id = t.num32(0)?;
            if id as usize >= MAX_SYNCPOINTS {
                return Err(t.error(format!("syncpoint {id} out of range")));
            }
            Directive::Syncpoint { id }
        }
        "flip" => {
            t.expect_args(5, 5)?;
            Directive::Flip {
                cpu_addr: t.num(0)?,
                width: t.num32(1)?,
                height: t.num32(2)?,
                stride: t.num32(3)?,
                format: t.num32(4)?,
            }
        }
        "rt" => {
            t.expect_args(6, 6)?;
            let index = t.num(0)? as usize;
            if index >= NUM_COLOR {
                return Err(t.error(format!("render target {index} out of range")));
            }
            Directive::RenderTarget {
                index,
                gpu_addr: t.num(1)?,
                width: t.num32(2)?,
                height: t.num32(3)?,
                format: t.num32(4)?,
                tiled: t.num(5)? != 0,
            }
        }
        "clear" => {
            t.expect_args(0, 1)?;
            Directive::Clear {
                color: if t.args.is_empty() { 0 } else { t.num32(0)? },
            }
        }
        "draw" => {
            t.expect_args(0, 0)?;
            Directive::Draw
        }
        other => {
            let access = other
                .strip_prefix("write")
                .map(|bits| (true, bits))
                .or_else(|| other.strip_prefix("read").map(|bits| (false, bits)));
            let Some((is_write, width)) = access.and_then(|(w, bits)| Some((w, width_of(bits)?)))
            else {
                return Err(t.error(format!("unknown directive '{other}'")));
            };
            if is_write {
                t.expect_args(2, 2)?;
                Directive::Write {
                    width,
                    addr: t.num(0)?,
                    value: t.num(1)?,
                }
            } else {
                t.expect_args(1, 1)?;
                Directive::Read {
                    width,
                    addr: t.num(0)?,
                }
            }
        }
    };
    Ok(Some(directive))
}

/// Parse a whole trace, keeping the line number of each directive.
pub fn parse(text: &str) -> Result<Vec<(usize, Directive)>, TraceError> {
    let mut directives = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if let Some(directive) = parse_line(index + 1, line)? {
            directives.push((index + 1, directive));
        }
    }
    Ok(directives)
}

// ================================================================================================
// Replay
// ================================================================================================

pub struct TraceRunner<B: GraphicsBackend> {
    gpu: Gpu<B>,
    stats: TraceStats,
}

impl<B: GraphicsBackend> TraceRunner<B> {
    pub fn new(gpu: Gpu<B>) -> Self {
        Self {
            gpu,
            stats: TraceStats::default(),
        }
    }

    pub fn gpu(&self) -> &Gpu<B> {
        &self.gpu
    }

    pub fn stats(&self) -> &TraceStats {
        &self.stats
    }

    /// Replay every directive, stopping at the first failure.
    pub fn run(&mut self, directives: &[(usize, Directive)]) -> Result<(), TraceError> {
        for &(line, directive) in directives {
            self.execute(line, directive)?;
        }
        // Whatever the trace left in flight is released before reporting
        self.gpu.finish();
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    pub fn execute(&mut self, line: usize, directive: Directive) -> Result<(), TraceError> {
        debug!("line {}: {:?}", line, directive);
        let gpu = &self.gpu;
        let memory = gpu.memory();
        match directive {
            Directive::MapCpu { base, size, target } => {
                memory.map_memory_region(base, size, target)?;
            }
            Directive::UnmapCpu { base, size } => {
                memory.unmap_region(base, size)?;
            }
            Directive::MapGpu {
                cpu_addr,
                gpu_addr,
                size,
            } => {
                gpu.memory_manager().map(cpu_addr, gpu_addr, size)?;
            }
            Directive::MapGpuAlloc {
                cpu_addr,
                size,
                align,
            } => {
                let gpu_addr = gpu.memory_manager().map_allocate(cpu_addr, size, align)?;
                info!("line {}: {:#x} mapped at GPU {:#x}", line, cpu_addr, gpu_addr);
            }
            Directive::UnmapGpu { gpu_addr, size } => {
                gpu.memory_manager().unmap(gpu_addr, size)?;
            }
            Directive::Write { width, addr, value } => match width {
                AccessWidth::U8 => memory.write8(addr, value as u8),
                AccessWidth::U16 => memory.write16(addr, value as u16),
                AccessWidth::U32 => memory.write32(addr, value as u32),
                AccessWidth::U64 => memory.write64(addr, value),
            },
            Directive::Read { width, addr } => {
                let value = match width {
                    AccessWidth::U8 => memory.read8(addr) as u64,
                    AccessWidth::U16 => memory.read16(addr) as u64,
                    AccessWidth::U32 => memory.read32(addr) as u64,
                    AccessWidth::U64 => memory.read64(addr),
                };
                info!("line {}: [{:#x}] = {:#x}", line, addr, value);
                self.stats.reads += 1;
            }
            Directive::Expect32 { addr, value } => {
                let actual = memory.read32(addr);
                if actual != value {
                    return Err(TraceError::Mismatch {
                        line,
                        addr,
                        expected: value as u64,
                        actual: actual as u64,
                    });
                }
                self.stats.expectations += 1;
            }
            Directive::Fill { addr, size, byte } => {
                memory.write_block(addr, &vec![byte; size as usize]);
            }
            Directive::Method { register, value } => {
                gpu.call_method(register, value, true);
                self.stats.methods += 1;
            }
            Directive::Flush => gpu.flush_commands(),
            Directive::Finish => gpu.finish(),
            Directive::TickFrame => gpu.tick_frame(),
            Directive::Semaphore { gpu_addr, value } => {
                if gpu.memory_manager().gpu_to_cpu_address(gpu_addr).is_none() {
                    return Err(TraceError::Parse {
                        line,
                        message: format!("semaphore address {gpu_addr:#x} is not mapped"),
                    });
                }
                gpu.signal_semaphore(gpu_addr, value);
            }
            Directive::Syncpoint { id } => gpu.signal_sync_point(id),
            Directive::Flip {
                cpu_addr,
                width,
                height,
                stride,
                format,
            } => {
                gpu.flip(&FramebufferConfig {
                    address: cpu_addr,
                    offset: 0,
                    width,
                    height,
                    stride,
                    pixel_format: format,
                });
                self.stats.flips += 1;
            }
            Directive::RenderTarget {
                index,
                gpu_addr,
                width,
                height,
                format,
                tiled,
            } => {
                let maxwell3d = gpu.maxwell3d();
                let count = maxwell3d.regs().rt_count.max(index as u32 + 1);
                maxwell3d.set_render_target(
                    index,
                    RenderTargetConfig {
                        address: gpu_addr,
                        width,
                        height,
                        format,
                        is_tiled: tiled,
                        layers: 1,
                        ..Default::default()
                    },
                );
                maxwell3d.set_render_target_count(count);
            }
            Directive::Clear { color } => {
                {
                    let mut regs = gpu.maxwell3d().regs();
                    regs.clear_color = color.to_le_bytes().map(|channel| channel as f32 / 255.0);
                    regs.clear_buffers = ClearBuffers {
                        color_mask: 0xF,
                        rt: 0,
                        ..Default::default()
                    };
                }
                gpu.rasterizer().clear();
            }
            Directive::Draw => {
                gpu.rasterizer().draw(false, false);
                self.stats.draws += 1;
            }
        }
        self.stats.directives += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let directives = parse(
            "# setup\n\
             \n\
             map_cpu 0x1000 0x1000 0x80000000  # trailing\n\
             write32 0x1004 0xdeadbeef\n\
             expect32 0x1004 3735928559\n",
        )
        .unwrap();
        assert_eq!(
            directives,
            vec![
                (
                    3,
                    Directive::MapCpu {
                        base: 0x1000,
                        size: 0x1000,
                        target: 0x8000_0000
                    }
                ),
                (
                    4,
                    Directive::Write {
                        width: AccessWidth::U32,
                        addr: 0x1004,
                        value: 0xdead_beef
                    }
                ),
                (
                    5,
                    Directive::Expect32 {
                        addr: 0x1004,
                        value: 0xdead_beef
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let err = parse("flush\nbogus 1 2\n").unwrap_err();
        assert!(matches!(err, TraceError::Parse { line: 2, .. }));

        let err = parse_line(7, "write32 0x10").unwrap_err();
        assert!(matches!(err, TraceError::Parse { line: 7, .. }));

        assert!(parse_line(1, "read128 0x10").is_err());
        assert!(parse_line(1, "method 0x10000 1").is_err());
        assert!(parse_line(1, "rt 8 0x0 4 4 0xd5 1").is_err());
        assert!(parse_line(1, "expect32 0x0 0x100000000").is_err());
    }

    #[test]
    fn test_parse_optional_arguments() {
        assert_eq!(
            parse_line(1, "map_gpu_alloc 0x1000 0x10000").unwrap(),
            Some(Directive::MapGpuAlloc {
                cpu_addr: 0x1000,
                size: 0x10000,
                align: 0
            })
        );
        assert_eq!(
            parse_line(1, "clear 0xff0000ff").unwrap(),
            Some(Directive::Clear { color: 0xff00_00ff })
        );
        assert_eq!(parse_line(1, "clear").unwrap(), Some(Directive::Clear { color: 0 }));
    }
}
