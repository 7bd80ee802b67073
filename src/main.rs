#[macro_use]
extern crate log;

use std::fs;
use std::io::{self, BufRead, ErrorKind as IoErrorKind, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};
use rand::Rng;
use simplelog::{Config, LevelFilter, SimpleLogger};
use structopt::StructOpt;

use ecbm_loader::boot::DEFAULT_BLOCK_SIZE;
use ecbm_loader::firmware::{self, Filler, FirmwareFile};
use ecbm_loader::{Bootloader, Ecbm, Options};

type LinuxEcbm = Ecbm<Serial, Delay, IoErrorKind>;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Device bus address
    #[structopt(long, default_value = "1")]
    address: u8,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Package a raw `.bin` image into an encrypted firmware container
    Encrypt {
        /// Raw firmware image
        file: PathBuf,
        /// Firmware name reported by the device once installed
        name: String,
        /// Firmware version, `major.minor.patch`
        version: String,
        /// Firmware key as 32 hex characters
        key: String,
        /// 16 character phrase the device uses to check the firmware key
        test_phrase: String,
        /// Pad with zeros rather than 0xFF
        #[structopt(long)]
        zero_fill: bool,
    },

    /// Upload an encrypted firmware container
    Upload {
        /// Container written by `encrypt`
        file: PathBuf,
        /// Device PIN
        #[structopt(long, default_value = "0")]
        pin: u32,
        /// Bytes per block write
        #[structopt(long, default_value = "256")]
        block_size: usize,
        /// Skip the confirmation prompt
        #[structopt(long)]
        yes: bool,
    },

    /// Show the bootloader and installed application
    Info {
        #[structopt(long, default_value = "0")]
        pin: u32,
    },

    /// Change the device PIN
    SetPin {
        #[structopt(long, default_value = "0")]
        pin: u32,
        new_pin: u32,
    },

    /// Print the authentication key derived from a PIN
    PinToKey { pin: u32 },

    /// Generate a random firmware key
    GenKey {
        /// Output format
        #[structopt(long, default_value = "both", possible_values = &["plain", "c", "both"])]
        fmt: String,
    },

    /// Write a 16 bit value to a device signature
    WriteU16 {
        sig: u16,
        value: u16,
        /// Open an encrypted session with this PIN first
        #[structopt(long)]
        pin: Option<u32>,
    },
}

fn main() -> Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    match &o.command {
        Command::Encrypt { file, name, version, key, test_phrase, zero_fill } => {
            let filler = if *zero_fill { Filler::Zeros } else { Filler::Ones };
            encrypt(file, name, version, key, test_phrase, filler)
        }
        Command::PinToKey { pin } => {
            println!("{}", c_array(&firmware::pin_to_key(*pin)));
            Ok(())
        }
        Command::GenKey { fmt } => {
            let mut key = [0u8; 16];
            rand::thread_rng().fill(&mut key[..]);

            if fmt != "c" {
                println!("{}", hex::encode_upper(key));
            }
            if fmt != "plain" {
                println!("{}", c_array(&key));
            }
            Ok(())
        }
        Command::Upload { file, pin, block_size, yes } => {
            upload(&o, file, *pin, *block_size, *yes)
        }
        Command::Info { pin } => {
            let mut ecbm = open(&o)?;
            let key = firmware::pin_to_key(*pin);
            let mut boot = Bootloader::new(&mut ecbm, o.address, &key)
                .context("Error connecting to bootloader")?;

            println!("bootloader: {}", boot.bootloader_info());

            let app = boot.firmware_info().context("Error reading firmware info")?;
            println!("app: {}", app);
            Ok(())
        }
        Command::SetPin { pin, new_pin } => {
            let mut ecbm = open(&o)?;
            let key = firmware::pin_to_key(*pin);
            let mut boot = Bootloader::new(&mut ecbm, o.address, &key)
                .context("Error connecting to bootloader")?;

            boot.set_new_auth_key(&firmware::pin_to_key(*new_pin))
                .context("Error setting new PIN")?;
            info!("PIN updated");
            Ok(())
        }
        Command::WriteU16 { sig, value, pin } => {
            let mut ecbm = open(&o)?;
            if let Some(pin) = pin {
                let key = firmware::pin_to_key(*pin);
                debug!("Static auth key: {}", hex::encode_upper(key));
                ecbm.begin_session(o.address, &key)
                    .context("Error beginning encrypted session")?;
            }

            debug!("Writing {} to signature {} of device {}", value, sig, o.address);
            ecbm.write(o.address, *sig, &value.to_be_bytes())
                .context("Error writing value")?;
            Ok(())
        }
    }
}

fn open(o: &Args) -> Result<LinuxEcbm> {
    info!("Connecting to serial port {}", o.port);

    Ecbm::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", o.port))
}

fn encrypt(file: &Path, name: &str, version: &str, key: &str, test_phrase: &str, filler: Filler) -> Result<()> {
    firmware::check_extension(file)?;
    let version = firmware::parse_version(version)?;
    let key = firmware::parse_key(key)?;

    let raw = fs::read(file).with_context(|| format!("Error reading {}", file.display()))?;
    println!("initial firmware size: {}", bytefmt::format(raw.len() as u64));

    let fw = FirmwareFile::package(name, version, &key, test_phrase, raw, filler)?;
    let packed = fw.to_bytes()?;

    let mut out = file.as_os_str().to_owned();
    out.push(".enc");
    let out = PathBuf::from(out);

    fs::write(&out, &packed).with_context(|| format!("Error writing {}", out.display()))?;

    println!("padded firmware size: {}", bytefmt::format(fw.data.len() as u64));
    println!("checksum: 0x{:08X}", fw.checksum);
    println!("written to '{}', {}", out.display(), bytefmt::format(packed.len() as u64));

    Ok(())
}

fn upload(o: &Args, file: &Path, pin: u32, block_size: usize, yes: bool) -> Result<()> {
    let raw = fs::read(file).with_context(|| format!("Error reading {}", file.display()))?;
    let fw = FirmwareFile::from_bytes(&raw)?;
    let info = fw.info()?;
    let test_phrase = fw.test_phrase()?;

    println!("firmware: {}", info);
    println!("size: {}", bytefmt::format(fw.data.len() as u64));

    if !yes && !confirm("continue?")? {
        println!("exit");
        return Ok(());
    }

    let mut ecbm = open(o)?;
    let key = firmware::pin_to_key(pin);
    let mut boot = Bootloader::new(&mut ecbm, o.address, &key).context("Error connecting to bootloader")?;

    let block_size = if block_size == 0 { DEFAULT_BLOCK_SIZE } else { block_size };

    let pb = ProgressBar::new(fw.data.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .progress_chars("=>-"),
    );

    let r = boot.upload_firmware_with_progress(&info, &test_phrase, &fw.data, block_size, |sent, _| {
        pb.set_position(sent as u64)
    });

    match r {
        Ok(()) => {
            pb.finish_with_message("complete");
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            Err(anyhow!("Upload failed: {}", e))
        }
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} y/n ", prompt);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    Ok(line.trim().eq_ignore_ascii_case("y"))
}

/// Format bytes as a C array initialiser
fn c_array(data: &[u8]) -> String {
    let bytes: Vec<_> = data.iter().map(|b| format!("0x{:02X}", b)).collect();
    format!("{{{}}}", bytes.join(", "))
}
