//! Inspect UBI images and the UBIFS filesystems inside them, without kernel support.
//!
//! Everything here is read-only: the image file is never written.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use ubifs_reader::{
    ubifs::{DirEntry, KeyHash, Location, MasterCopy, NodeBody, VisitNode},
    Config, FileImage, UbiImage, Ubifs, Volume, VolumeSelector,
};

/// Parse a size given in decimal or `0x`-prefixed hex
fn parse_size(s: &str) -> Result<u32> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.with_context(|| format!("invalid size {s:?}"))
}

#[derive(Args, Debug)]
struct ImageOptions {
    /// Path to the UBI image
    image: PathBuf,

    /// PEB size in bytes; probed from the image when omitted
    #[clap(long, value_parser = parse_size)]
    peb_size: Option<u32>,

    /// Which master node copy to trust (auto, 0 or 1)
    #[clap(long, default_value = "auto")]
    master: MasterCopy,

    /// Start the index at this node (LEB:offset) instead of the root named by the master node
    #[clap(long)]
    index_root: Option<Location>,

    /// Operate on this volume (ID or name); may be repeated, defaults to every volume
    #[clap(long = "volume", short = 'V')]
    volumes: Vec<VolumeSelector>,

    /// Override the directory-entry hash recorded in the superblock (r5 or test)
    #[clap(long)]
    key_hash: Option<KeyHash>,

    /// Fail on damaged nodes instead of skipping them
    #[clap(long)]
    strict: bool,

    /// Stop an operation after reading this many nodes
    #[clap(long)]
    node_limit: Option<u64>,
}

impl ImageOptions {
    fn config(&self) -> Config {
        let mut config = Config::new().master(self.master).strict(self.strict);
        if let Some(size) = self.peb_size {
            config = config.peb_size(size);
        }
        if let Some(root) = self.index_root {
            config = config.index_root(root);
        }
        for volume in &self.volumes {
            config = config.volume(volume.clone());
        }
        if let Some(hash) = self.key_hash {
            config = config.key_hash(hash);
        }
        if let Some(limit) = self.node_limit {
            config = config.node_limit(limit);
        }
        config
    }

    fn open(&self, config: &Config) -> Result<UbiImage<FileImage>> {
        let file = FileImage::open(&self.image)
            .with_context(|| format!("could not open {}", self.image.display()))?;
        Ok(UbiImage::open(file, config)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the volume table, and optionally what each PEB holds
    Volumes {
        /// Also print a summary of the content of each PEB
        #[clap(long)]
        pebs: bool,
    },

    /// Print the superblock and master node of each UBIFS volume
    Info,

    /// List a directory
    Ls {
        #[clap(default_value = "/")]
        path: String,

        /// List everything below the directory
        #[clap(short, long)]
        recursive: bool,
    },

    /// Write the contents of a file to stdout
    Cat { path: String },

    /// Print every node of the index, indented by depth
    Tree,

    /// Decode the node at LEB:offset
    Node { loc: Location },
}

fn volume_label<S>(volume: &Volume<'_, S>) -> String
where
    S: ubifs_reader::ImageSource,
{
    match volume.name() {
        Some(name) => format!("volume {} ({name})", volume.id()),
        None => format!("volume {}", volume.id()),
    }
}

impl Command {
    fn execute(&self, image: &UbiImage<FileImage>, config: &Config) -> Result<()> {
        if let Command::Volumes { pebs } = self {
            println!("PEB size: {:#x}", image.peb_size());
            if *pebs {
                for (i, content) in image.ebt().iter().enumerate() {
                    println!("{i:4} => {content:?}");
                }
            }
            for volume in image.selected_volumes(config)? {
                let kind = volume
                    .info()
                    .map_or("unknown".to_string(), |x| x.vol_type.to_string());
                println!(
                    "{:>4}  {:<8} {:>5} LEBs {:>10} bytes  {}",
                    volume.id(),
                    kind,
                    volume.leb_count(),
                    volume.data_size(),
                    volume.name().unwrap_or("-"),
                );
            }
            return Ok(());
        }

        let volumes = image.selected_volumes(config)?;
        let several = volumes.len() > 1;
        for volume in volumes {
            let label = volume_label(&volume);
            let fs = match Ubifs::open(volume, config) {
                Ok(fs) => fs,
                // Without an explicit selection, volumes that are not UBIFS are skipped
                Err(e) if config.volumes.is_empty() => {
                    log::info!("{label}: not UBIFS: {e}");
                    continue;
                }
                Err(e) => return Err(e).with_context(|| label.clone()),
            };
            if several {
                println!("== {label} ==");
            }
            self.execute_fs(&fs).with_context(|| label.clone())?;
        }

        Ok(())
    }

    fn execute_fs(&self, fs: &Ubifs<'_, FileImage>) -> Result<()> {
        let mut trace = fs.trace();

        match self {
            Command::Volumes { .. } => unreachable!(),

            Command::Info => {
                let resolved = fs.master();
                println!("{:#?}", resolved.superblock);
                println!(
                    "master node at {} (copy {}), sqnum {}",
                    resolved.loc, resolved.copy, resolved.sqnum
                );
                println!("{:#?}", resolved.master);
                println!("index root {} ({} bytes)", resolved.root, resolved.root_len);
                println!("key hash {}", resolved.key_hash);
            }

            Command::Ls { path, recursive } => {
                let entries: Vec<(String, DirEntry)> = if *recursive {
                    fs.walk(path, &mut trace)?
                        .into_iter()
                        .map(|x| (x.path, x.entry))
                        .collect()
                } else {
                    fs.list(path, &mut trace)?
                        .into_iter()
                        .map(|x| (x.name_lossy().into_owned(), x))
                        .collect()
                };

                for (name, entry) in entries {
                    let size = u32::try_from(entry.inum)
                        .ok()
                        .and_then(|inum| fs.inode(inum, &mut trace).ok())
                        .map_or("?".to_string(), |x| x.size.to_string());
                    println!(
                        "{} {:>8} {:>10}  {name}",
                        entry.file_type.symbol(),
                        entry.inum,
                        size
                    );
                }
            }

            Command::Cat { path } => {
                let data = fs.read(path, &mut trace)?;
                std::io::stdout().lock().write_all(&data)?;
            }

            Command::Tree => {
                fs.index().for_each_node(&mut trace, |visit| {
                    let indent = "  ".repeat(visit.depth);
                    match &visit.node {
                        Ok(VisitNode::Index(idx)) => println!(
                            "{indent}{} index level {}, {} branches",
                            visit.loc,
                            idx.level,
                            idx.branches.len()
                        ),
                        Ok(VisitNode::Leaf(node)) => println!("{indent}{node}"),
                        Err(warning) => println!("{indent}{} damaged: {warning}", visit.loc),
                    }
                })?;
            }

            Command::Node { loc } => {
                let node = fs.read_node(*loc, &mut trace)?;
                println!("{node}");
                match &node.body {
                    NodeBody::Data(block) => {
                        println!("{} bytes, {:?}", block.size, block.compression())
                    }
                    body => println!("{body:#?}"),
                }
            }
        }

        if !trace.warnings().is_empty() {
            log::info!("{} nodes read, {} warnings", trace.visited(), trace.warnings().len());
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    image: ImageOptions,

    /// Show progress while scanning the image
    #[clap(long, global = true)]
    progress: bool,

    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if args.progress {
        howudoin::init(howudoin::consumers::TermLine::default());
    }

    let config = args.image.config();
    let image = args.image.open(&config)?;

    args.cmd.execute(&image, &config)
}
