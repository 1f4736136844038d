use std::{
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    sync::Mutex,
};

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{config::Config, device::DeviceInfo};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("toolchain produced no artifact at {0}")]
    MissingArtifact(PathBuf),
    #[error("{0}")]
    Other(String),
}

/// Turns a program's intermediate form into a loadable artifact.
pub trait CodeGenerator: Send + Sync {
    /// Builds `kernel` of the program in `tmpdir` for `device` and returns the artifact path.
    fn generate(
        &self,
        tmpdir: &Path,
        kernel: &str,
        device: &DeviceInfo,
    ) -> Result<PathBuf, BuildError>;

    /// Places an artifact at a device load address. Position-independent targets keep it as is.
    fn link(&self, artifact: &Path, address: u64, kernel: &str) -> Result<PathBuf, BuildError> {
        let _ = (address, kernel);
        Ok(artifact.to_path_buf())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tmpdir: PathBuf,
    kernel: String,
}

/// Process-wide map from (program directory, kernel) to built artifact.
///
/// Entries are never evicted. A single lock covers lookups and builds, so a kernel is built at
/// most once and a failed build leaves no entry.
#[derive(Debug, Default)]
pub struct CompilerCache {
    entries: Mutex<HashMap<CacheKey, PathBuf>>,
}

impl CompilerCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, generator, device)))]
    pub fn get_or_build(
        &self,
        tmpdir: &Path,
        kernel: &str,
        generator: &dyn CodeGenerator,
        device: &DeviceInfo,
    ) -> Result<PathBuf, BuildError> {
        let key = CacheKey {
            tmpdir: tmpdir.to_path_buf(),
            kernel: kernel.to_string(),
        };
        let mut entries = self.entries.lock().expect("failed to lock");
        if let Some(artifact) = entries.get(&key) {
            return Ok(artifact.clone());
        }

        let artifact = generator.generate(tmpdir, kernel, device)?;
        log::debug!("built `{kernel}` in {}: {}", tmpdir.display(), artifact.display());
        entries.insert(key, artifact.clone());
        Ok(artifact)
    }

    pub fn get(&self, tmpdir: &Path, kernel: &str) -> Option<PathBuf> {
        let key = CacheKey {
            tmpdir: tmpdir.to_path_buf(),
            kernel: kernel.to_string(),
        };
        let entries = self.entries.lock().expect("failed to lock");
        entries.get(&key).cloned()
    }

    #[inline]
    pub fn contains(&self, tmpdir: &Path, kernel: &str) -> bool {
        self.get(tmpdir, kernel).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("failed to lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One external command. Arguments may use `{input}`, `{output}`, `{address}`, `{kernel}` and
/// `{target}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStep {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolStep {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map_into().collect(),
        }
    }

    fn expand(&self, vars: &Vars) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &vars.input.to_string_lossy())
                    .replace("{output}", &vars.output.to_string_lossy())
                    .replace("{address}", &format!("{:#x}", vars.address))
                    .replace("{kernel}", vars.kernel)
                    .replace("{target}", vars.target)
            })
            .collect()
    }
}

struct Vars<'a> {
    input: &'a Path,
    output: &'a Path,
    address: u64,
    kernel: &'a str,
    target: &'a str,
}

impl<'a> Vars<'a> {
    fn new(input: &'a Path, output: &'a Path, kernel: &'a str, target: &'a str) -> Self {
        Self {
            input,
            output,
            address: 0,
            kernel,
            target,
        }
    }
}

/// Builds kernels by running external tools over `<tmpdir>/<bitcode>`.
///
/// The artifact is `<tmpdir>/<kernel>.so` and is reused if it already exists. The link step
/// writes to `<kernel>.so.tmp`, renamed into place only after it succeeds. Intermediates and the
/// bitcode are removed after a build unless temp files are kept.
#[derive(Debug, Clone)]
pub struct Toolchain {
    bitcode: String,
    codegen: ToolStep,
    assemble: Option<ToolStep>,
    link: ToolStep,
    relocate: Option<ToolStep>,
    leave_temp_files: bool,
    level: log::Level,
}

impl Toolchain {
    pub const DEFAULT_BITCODE: &str = "parallel.bc";

    pub fn new(codegen: ToolStep, link: ToolStep) -> Self {
        Self {
            bitcode: Self::DEFAULT_BITCODE.into(),
            codegen,
            assemble: None,
            link,
            relocate: None,
            leave_temp_files: false,
            level: log::Level::Debug,
        }
    }

    pub fn with_bitcode(mut self, name: impl Into<String>) -> Self {
        self.bitcode = name.into();
        self
    }

    /// Adds a step between code generation and linking.
    pub fn with_assembler(mut self, step: ToolStep) -> Self {
        self.assemble = Some(step);
        self
    }

    /// Relinks an artifact at a fixed load address.
    pub fn with_relocation(mut self, step: ToolStep) -> Self {
        self.relocate = Some(step);
        self
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.leave_temp_files = config.leave_compiler_temp_files;
        self.level = config.transfer_level();
        self
    }

    fn run(&self, step: &ToolStep, vars: &Vars) -> Result<(), BuildError> {
        let args = step.expand(vars);
        let command = std::iter::once(step.program.as_str())
            .chain(args.iter().map(String::as_str))
            .join(" ");
        log::log!(self.level, "running `{command}`");

        let output = Command::new(&step.program)
            .args(&args)
            .output()
            .map_err(|source| BuildError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BuildError::Command {
                command,
                status: output.status,
                stderr,
            });
        }
        Ok(())
    }

    fn build(
        &self,
        tmpdir: &Path,
        kernel: &str,
        target: &str,
        artifact: &Path,
        temp: &mut Vec<PathBuf>,
    ) -> Result<(), BuildError> {
        let input = tmpdir.join(&self.bitcode);
        let assembly = tmpdir.join(format!("{kernel}.s"));
        let object = tmpdir.join(format!("{kernel}.o"));

        // 1. code generation
        let output = match self.assemble {
            Some(_) => &assembly,
            None => &object,
        };
        temp.push(output.clone());
        self.run(&self.codegen, &Vars::new(&input, output, kernel, target))?;

        // 2. assembly
        if let Some(step) = &self.assemble {
            temp.push(object.clone());
            self.run(step, &Vars::new(&assembly, &object, kernel, target))?;
        }

        // 3. link into a staging file, published once complete
        let staged = artifact.with_extension("so.tmp");
        let linked = self
            .run(&self.link, &Vars::new(&object, &staged, kernel, target))
            .and_then(|_| match staged.exists() {
                true => Ok(()),
                false => Err(BuildError::MissingArtifact(staged.clone())),
            })
            .and_then(|_| {
                std::fs::rename(&staged, artifact).map_err(|source| BuildError::Io {
                    path: artifact.to_path_buf(),
                    source,
                })
            });
        if let Err(err) = linked {
            _ = std::fs::remove_file(&staged);
            return Err(err);
        }

        // 4. the bitcode is consumed
        temp.push(input);
        Ok(())
    }

    fn remove(&self, paths: &[PathBuf]) {
        if self.leave_temp_files {
            return;
        }
        for path in paths {
            if let Err(err) = std::fs::remove_file(path) {
                log::debug!("failed to remove {}: {err}", path.display());
            }
        }
    }
}

impl CodeGenerator for Toolchain {
    fn generate(
        &self,
        tmpdir: &Path,
        kernel: &str,
        device: &DeviceInfo,
    ) -> Result<PathBuf, BuildError> {
        let artifact = tmpdir.join(format!("{kernel}.so"));
        if artifact.exists() {
            log::debug!("reusing {}", artifact.display());
            return Ok(artifact);
        }

        let mut temp = vec![];
        let result = self.build(tmpdir, kernel, &device.name, &artifact, &mut temp);
        self.remove(&temp);
        result.map(|_| artifact)
    }

    fn link(&self, artifact: &Path, address: u64, kernel: &str) -> Result<PathBuf, BuildError> {
        let Some(step) = &self.relocate else {
            return Ok(artifact.to_path_buf());
        };
        let output = artifact.with_extension(format!("{address:x}.bin"));
        let vars = Vars {
            input: artifact,
            output: &output,
            address,
            kernel,
            target: "",
        };
        self.run(step, &vars)?;
        match output.exists() {
            true => Ok(output),
            false => Err(BuildError::MissingArtifact(output)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::{BuildError, CodeGenerator, CompilerCache};
    use crate::loom::device::{DeviceInfo, DeviceType};

    fn device() -> DeviceInfo {
        DeviceInfo {
            name: "test".into(),
            r#type: DeviceType::Accelerator,
            memory_family: "test".into(),
            pointer_width: 4,
            big_endian: true,
            global_mem_size: 1024,
            max_mem_alloc_size: 1024,
            max_work_group_size: 1,
            image_support: false,
            native_kernels: false,
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CodeGenerator for Counting {
        fn generate(
            &self,
            tmpdir: &Path,
            kernel: &str,
            _device: &DeviceInfo,
        ) -> Result<PathBuf, BuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(10));
            match self.fail {
                true => Err(BuildError::Other("no backend".into())),
                false => Ok(tmpdir.join(format!("{kernel}.so"))),
            }
        }
    }

    #[test]
    fn test_build_once() -> Result<(), Box<dyn Error>> {
        let cache = Arc::new(CompilerCache::new());
        let generator = Arc::new(Counting::default());
        let tmpdir = PathBuf::from("/tmp/program");

        let handles = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let generator = generator.clone();
                let tmpdir = tmpdir.clone();
                std::thread::spawn(move || {
                    cache.get_or_build(&tmpdir, "scale", generator.as_ref(), &device())
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let artifact = handle.join().map_err(|_| "thread panicked")??;
            assert_eq!(artifact, tmpdir.join("scale.so"));
        }

        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&tmpdir, "scale"));
        assert!(!cache.contains(&tmpdir, "other"));
        Ok(())
    }

    #[test]
    fn test_failure_not_cached() {
        let cache = CompilerCache::new();
        let generator = Counting {
            fail: true,
            ..Default::default()
        };
        let tmpdir = Path::new("/tmp/program");
        for _ in 0..2 {
            let result = cache.get_or_build(tmpdir, "scale", &generator, &device());
            assert!(matches!(result, Err(BuildError::Other(_))));
        }
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_toolchain() -> Result<(), Box<dyn Error>> {
        use super::{ToolStep, Toolchain};
        use crate::loom::config::Config;

        let dir = tempfile::tempdir()?;
        let bitcode = dir.path().join("parallel.bc");
        std::fs::write(&bitcode, b"program")?;

        let copy = || ToolStep::new("cp", ["{input}", "{output}"]);
        let toolchain = Toolchain::new(copy(), copy()).with_assembler(copy());
        let artifact = toolchain.generate(dir.path(), "scale", &device())?;
        assert_eq!(artifact, dir.path().join("scale.so"));
        assert_eq!(std::fs::read(&artifact)?, b"program");
        assert!(!dir.path().join("scale.s").exists());
        assert!(!dir.path().join("scale.o").exists());
        assert!(!dir.path().join("scale.so.tmp").exists());
        assert!(!bitcode.exists());

        // intermediates stay when asked to
        let config = Config {
            leave_compiler_temp_files: true,
            ..Default::default()
        };
        std::fs::write(&bitcode, b"program")?;
        let toolchain = Toolchain::new(copy(), copy()).with_config(&config);
        toolchain.generate(dir.path(), "other", &device())?;
        assert!(dir.path().join("other.o").exists());
        assert!(bitcode.exists());

        // a failing step reports the command
        let toolchain = Toolchain::new(ToolStep::new("false", ["{input}"]), copy());
        let result = toolchain.generate(dir.path(), "broken", &device());
        assert!(matches!(result, Err(BuildError::Command { .. })));
        assert!(!dir.path().join("broken.so").exists());

        // relocation produces a file per load address
        let toolchain = Toolchain::new(copy(), copy()).with_relocation(copy());
        let linked = toolchain.link(&artifact, 0x1000, "scale")?;
        assert_eq!(linked, dir.path().join("scale.1000.bin"));
        assert!(linked.exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_link_not_published() -> Result<(), Box<dyn Error>> {
        use super::{ToolStep, Toolchain};

        let dir = tempfile::tempdir()?;
        let bitcode = dir.path().join("parallel.bc");
        std::fs::write(&bitcode, b"program")?;
        let cache = CompilerCache::new();

        // the link step leaves a partial output behind and fails
        let copy = || ToolStep::new("cp", ["{input}", "{output}"]);
        let partial = ToolStep::new("sh", ["-c", "echo partial > \"$0\"; exit 1", "{output}"]);
        let toolchain = Toolchain::new(copy(), partial);
        for _ in 0..2 {
            let result = cache.get_or_build(dir.path(), "k", &toolchain, &device());
            assert!(matches!(result, Err(BuildError::Command { .. })));
            assert!(!dir.path().join("k.so").exists());
            assert!(!dir.path().join("k.so.tmp").exists());
        }
        assert!(cache.is_empty());
        assert!(bitcode.exists());

        // a later successful build is published
        let toolchain = Toolchain::new(copy(), copy());
        let artifact = cache.get_or_build(dir.path(), "k", &toolchain, &device())?;
        assert_eq!(std::fs::read(&artifact)?, b"program");
        assert!(cache.contains(dir.path(), "k"));
        Ok(())
    }
}
