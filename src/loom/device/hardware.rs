//! Access to soft-core processors exposed through sysfs.
//!
//! Cores appear as `<root>/<fpga>/core<N>/` directories with the attribute files `run`, `reset`,
//! `reset_vector`, `done` and `name`, plus a `memory` file addressing the core's RAM.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

pub const DEFAULT_ROOT: &str = "/sys/class/rvex";

/// Control surface of one core.
pub trait Core: Send {
    fn name(&self) -> &str;

    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> std::io::Result<()>;

    fn write_memory(&mut self, address: u64, data: &[u8]) -> std::io::Result<()>;

    fn set_run(&mut self, run: bool) -> std::io::Result<()>;

    fn set_reset(&mut self, reset: bool) -> std::io::Result<()>;

    /// Address the core starts executing at after a reset.
    fn set_reset_vector(&mut self, address: u32) -> std::io::Result<()>;

    fn done(&mut self) -> std::io::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreLocation {
    pub fpga: usize,
    pub core: usize,
    pub path: PathBuf,
}

fn sorted_dirs(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = std::fs::read_dir(path)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect::<Vec<_>>();
    dirs.sort();
    Ok(dirs)
}

/// Lists every core under `root`, ordered by FPGA then core. A missing root means no cores.
pub fn discover(root: &Path) -> std::io::Result<Vec<CoreLocation>> {
    if !root.is_dir() {
        return Ok(vec![]);
    }

    let mut cores = vec![];
    for (fpga, dir) in sorted_dirs(root)?.into_iter().enumerate() {
        let paths = sorted_dirs(&dir)?.into_iter().filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("core"))
        });
        for (core, path) in paths.enumerate() {
            cores.push(CoreLocation { fpga, core, path });
        }
    }
    Ok(cores)
}

/// A core driven through its sysfs attribute files.
#[derive(Debug)]
pub struct SysfsCore {
    name: String,
    path: PathBuf,
    memory: File,
}

impl SysfsCore {
    pub fn open(location: &CoreLocation) -> std::io::Result<Self> {
        let path = location.path.clone();
        let name = match std::fs::read_to_string(path.join("name")) {
            Ok(name) => name.trim().to_string(),
            Err(_) => format!("rvex{}.{}", location.fpga, location.core),
        };
        let memory = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.join("memory"))?;
        Ok(Self { name, path, memory })
    }

    fn set(&self, attribute: &str, value: impl std::fmt::Display) -> std::io::Result<()> {
        std::fs::write(self.path.join(attribute), format!("{value}\n"))
    }

    fn get(&self, attribute: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.path.join(attribute)).map(|value| value.trim().to_string())
    }
}

impl Core for SysfsCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> std::io::Result<()> {
        self.memory.seek(SeekFrom::Start(address))?;
        self.memory.read_exact(data)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> std::io::Result<()> {
        self.memory.seek(SeekFrom::Start(address))?;
        self.memory.write_all(data)?;
        self.memory.flush()
    }

    fn set_run(&mut self, run: bool) -> std::io::Result<()> {
        self.set("run", u8::from(run))
    }

    fn set_reset(&mut self, reset: bool) -> std::io::Result<()> {
        self.set("reset", u8::from(reset))
    }

    fn set_reset_vector(&mut self, address: u32) -> std::io::Result<()> {
        self.set("reset_vector", format_args!("{address:#x}"))
    }

    fn done(&mut self) -> std::io::Result<bool> {
        let value = self.get("done")?;
        Ok(value != "0")
    }
}
