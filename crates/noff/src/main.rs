use clap::Parser;
use elf::ElfBytes;
use elf::abi::SHT_NOBITS;
use elf::endian::AnyEndian;
use std::fs;
use std::path::PathBuf;

use noff::{NoffBuilder, NoffHeader};

#[derive(Parser)]
#[command(name = "elf2noff")]
#[command(about = "Converts a statically linked ELF program into a NOFF image")]
struct Args {
    /// Input ELF file, linked at address 0
    #[arg(short, long)]
    input: PathBuf,

    /// Output NOFF file
    #[arg(short, long)]
    output: PathBuf,

    /// Write the header in big-endian byte order
    #[arg(long)]
    big_endian: bool,
}

const CODE_SECTIONS: &[&str] = &[".text"];
const DATA_SECTIONS: &[&str] = &[".rodata", ".rdata", ".data", ".sdata"];
const BSS_SECTIONS: &[&str] = &[".sbss", ".bss"];

/// A contiguous run of the address space gathered from one or more ELF sections.
#[derive(Default)]
struct Extent {
    start: u64,
    bytes: Vec<u8>,
    size: u64,
}

impl Extent {
    fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Extends the run to cover `[addr, addr + size)`, copying `data` when present.
    ///
    /// Gaps between sections are zero-filled.
    fn add(&mut self, addr: u64, size: u64, data: Option<&[u8]>) {
        if size == 0 {
            return;
        }

        if self.is_empty() {
            self.start = addr;
        } else if addr < self.start {
            let shift = (self.start - addr) as usize;
            if !self.bytes.is_empty() {
                self.bytes.splice(0..0, std::iter::repeat_n(0, shift));
            }
            self.size += self.start - addr;
            self.start = addr;
        }

        let end = (addr + size).max(self.start + self.size);
        self.size = end - self.start;

        if let Some(data) = data {
            let offset = (addr - self.start) as usize;
            if self.bytes.len() < offset + data.len() {
                self.bytes.resize(offset + data.len(), 0);
            }
            self.bytes[offset..offset + data.len()].copy_from_slice(data);
        }
    }
}

fn collect(
    elf: &ElfBytes<'_, AnyEndian>,
    names: &[&str],
) -> Result<Extent, Box<dyn std::error::Error>> {
    let mut extent = Extent::default();

    for name in names {
        let Some(header) = elf.section_header_by_name(name)? else {
            continue;
        };

        if header.sh_type == SHT_NOBITS {
            extent.add(header.sh_addr, header.sh_size, None);
        } else {
            let (data, compression) = elf.section_data(&header)?;
            if compression.is_some() {
                return Err(format!("section {name} is compressed").into());
            }
            extent.add(header.sh_addr, header.sh_size, Some(data));
        }
    }

    Ok(extent)
}

fn to_u32(value: u64, what: &str) -> Result<u32, Box<dyn std::error::Error>> {
    u32::try_from(value).map_err(|_| format!("{what} {value:#x} does not fit in 32 bits").into())
}

fn convert(args: &Args) -> Result<NoffHeader, Box<dyn std::error::Error>> {
    let file_data = fs::read(&args.input)?;
    let elf = ElfBytes::<AnyEndian>::minimal_parse(&file_data)?;

    let code = collect(&elf, CODE_SECTIONS)?;
    if code.is_empty() {
        return Err("input has no .text section".into());
    }
    let data = collect(&elf, DATA_SECTIONS)?;
    let bss = collect(&elf, BSS_SECTIONS)?;

    let mut data_bytes = data.bytes;
    data_bytes.resize(data.size as usize, 0);

    let builder = NoffBuilder::new()
        .code(to_u32(code.start, "code address")?, &code.bytes)
        .data(to_u32(data.start, "data address")?, &data_bytes)
        .bss(
            to_u32(bss.start, "bss address")?,
            to_u32(bss.size, "bss size")?,
        )
        .swapped(args.big_endian);

    let header = builder.header();
    fs::write(&args.output, builder.build())?;
    Ok(header)
}

fn main() {
    let args = Args::parse();

    match convert(&args) {
        Ok(header) => {
            println!("Wrote {}", args.output.display());
            println!(
                "  code:   {:#010x} {:>8} bytes",
                header.code.virtual_addr, header.code.size
            );
            println!(
                "  data:   {:#010x} {:>8} bytes",
                header.init_data.virtual_addr, header.init_data.size
            );
            println!(
                "  bss:    {:#010x} {:>8} bytes",
                header.uninit_data.virtual_addr, header.uninit_data.size
            );
        }
        Err(e) => {
            eprintln!("Error converting {}: {}", args.input.display(), e);
            std::process::exit(1);
        }
    }
}
