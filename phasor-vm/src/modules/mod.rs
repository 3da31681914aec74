//! The module runtime: manifest-driven loading of bytecode units into their
//! own [`Vm`] instance, an mtime-checked cache keyed by (manifest path,
//! owner), and cross-instance calls gated by the caller's import list.
//!
//! The lexer and parser that would turn a module's original source text
//! into a [`Bytecode`] are out of scope for this crate — a manifest's
//! `sources` name already-compiled `.phsb`/`.phir` artifacts, checksummed
//! and decoded directly rather than compiled from scratch.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use phasor_isa::{PanicReason, Value};

use crate::bytecode::Bytecode;
use crate::codec::{binary, text};
use crate::consts::CHECKSUM_SKIP;
use crate::error::{LoadError, Result, RuntimeError};
use crate::interpreter::{InstanceHandle, Vm};

/// A module's JSON descriptor. Paths in `sources` and `imports` are
/// resolved relative to the manifest's own directory.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// The module's declared name.
    pub name: String,
    /// The entry function to run eagerly on load, as `"qualifier:name"` or
    /// a bare function name; empty means no eager entry point.
    #[serde(default)]
    pub entry: String,
    /// Paths (relative to the manifest) to this module's compiled bytecode
    /// artifacts. Only the first is loaded as the instance's `Bytecode`;
    /// the rest are checksummed but otherwise auxiliary, since this crate
    /// has no multi-unit linker.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Paths to other manifests this module is permitted to call into.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Function names this module permits other instances to call via
    /// `callTrans`. An empty list exports every function.
    #[serde(default)]
    pub exports: Vec<String>,
    /// Free-form version string, not interpreted by the runtime.
    #[serde(default)]
    pub version: String,
    /// If true, `entry` is not run automatically on load.
    #[serde(default)]
    pub lazy: bool,
    /// SHA-256 hex digests, one per `sources` entry, in order. `"SKIP"`
    /// bypasses validation for that entry.
    #[serde(default)]
    pub checksums: Vec<String>,
}

impl Manifest {
    fn read(path: &Path) -> std::result::Result<Self, LoadError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| LoadError::InvalidManifest(e.to_string()))
    }
}

struct CacheEntry {
    handle: InstanceHandle,
    mtime: SystemTime,
    exports: Vec<String>,
}

/// Coordinates multiple [`Vm`] instances, one per loaded module.
///
/// Holds the single [`Vm`] every loaded module's instance lives in, plus
/// the cache and export table used to resolve `loadModule` and
/// `callTrans`/`callExtern`.
pub struct ModuleRuntime {
    vm: Vm,
    cache: HashMap<(PathBuf, InstanceHandle), CacheEntry>,
}

impl Default for ModuleRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRuntime {
    /// Creates a runtime with no modules loaded.
    pub fn new() -> Self {
        Self { vm: Vm::new(), cache: HashMap::new() }
    }

    /// The underlying VM, for registering natives before loading modules.
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// The underlying VM, mutably.
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Loads the module described by the manifest at `path`, or returns the
    /// cached handle if it was already loaded for `owner` and the file
    /// hasn't changed since.
    ///
    /// Circular imports are permitted: the cache entry for a module is
    /// inserted before its own imports are resolved, so an import cycle
    /// back to a module already in progress resolves to its (still being
    /// populated) instance rather than recursing forever.
    pub fn load_module(&mut self, path: impl AsRef<Path>, owner: InstanceHandle) -> Result<InstanceHandle> {
        let canonical = path.as_ref().canonicalize().map_err(LoadError::from)?;
        let key = (canonical.clone(), owner);

        if let Some(cached) = self.cache.get(&key) {
            let mtime = file_mtime(&canonical)?;
            if mtime == cached.mtime {
                return Ok(cached.handle);
            }
            let stale = cached.handle;
            self.cache.remove(&key);
            self.vm.destroy_instance(stale);
        }

        let dir = canonical.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let manifest = Manifest::read(&canonical)?;
        validate_checksums(&dir, &manifest)?;

        let bytecode = compile_sources(&dir, &manifest)?;
        let handle = self.vm.load(Rc::new(bytecode));
        let mtime = file_mtime(&canonical)?;
        self.cache.insert(key, CacheEntry { handle, mtime, exports: manifest.exports.clone() });

        let mut imports = Vec::with_capacity(manifest.imports.len());
        for import_path in &manifest.imports {
            imports.push(self.load_module(dir.join(import_path), owner)?);
        }
        if let Some(instance) = self.vm.instance_mut(handle) {
            instance.imports.extend(imports);
        }

        if !manifest.lazy && !manifest.entry.is_empty() {
            let entry_fn = manifest.entry.rsplit(':').next().unwrap_or(&manifest.entry);
            self.vm.execute_entry(handle, entry_fn)?;
        }

        Ok(handle)
    }

    /// Calls `funcName` on `target` from `caller`. Faults with
    /// [`PanicReason::ModuleAccessViolation`] if `target` is not among
    /// `caller`'s resolved imports, and with
    /// [`PanicReason::ModuleExportNotFound`] if `target` declares a
    /// non-empty export list that excludes `funcName`.
    pub fn call_trans(&mut self, caller: InstanceHandle, target: InstanceHandle, func_name: &str, args: Vec<Value>) -> Result<Value> {
        let permitted = self
            .vm
            .instance(caller)
            .ok_or_else(|| RuntimeError::fault(PanicReason::UnknownFunction, "no such caller instance"))?
            .imports
            .contains(&target);
        if !permitted {
            return Err(RuntimeError::fault(
                PanicReason::ModuleAccessViolation,
                "target instance is not in the caller's imports",
            ));
        }
        if let Some(exports) = self.exports_of(target) {
            if !exports.is_empty() && !exports.iter().any(|e| e == func_name) {
                return Err(RuntimeError::fault(
                    PanicReason::ModuleExportNotFound,
                    format!("`{func_name}` is not exported by the target module"),
                ));
            }
        }
        self.vm.call_function(target, func_name, args)
    }

    /// `loadModule(path, caller)` followed by `callTrans`, registering the
    /// freshly loaded module as one of `caller`'s imports if it wasn't
    /// already.
    pub fn call_extern(&mut self, caller: InstanceHandle, path: impl AsRef<Path>, func_name: &str, args: Vec<Value>) -> Result<Value> {
        let target = self.load_module(path, caller)?;
        if let Some(instance) = self.vm.instance_mut(caller) {
            if !instance.imports.contains(&target) {
                instance.imports.push(target);
            }
        }
        self.call_trans(caller, target, func_name, args)
    }

    fn exports_of(&self, handle: InstanceHandle) -> Option<&[String]> {
        self.cache.values().find(|entry| entry.handle == handle).map(|entry| entry.exports.as_slice())
    }
}

fn file_mtime(path: &Path) -> Result<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).map_err(|e| RuntimeError::from(LoadError::from(e)))
}

fn validate_checksums(dir: &Path, manifest: &Manifest) -> Result<()> {
    if manifest.sources.len() != manifest.checksums.len() {
        return Err(RuntimeError::from(LoadError::ChecksumCountMismatch {
            sources: manifest.sources.len(),
            checksums: manifest.checksums.len(),
        }));
    }
    for (source, expected) in manifest.sources.iter().zip(&manifest.checksums) {
        if expected == CHECKSUM_SKIP {
            continue;
        }
        let bytes = fs::read(dir.join(source)).map_err(LoadError::from)?;
        let digest = Sha256::digest(&bytes);
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        if &hex != expected {
            return Err(RuntimeError::from(LoadError::SourceChecksumMismatch(source.clone())));
        }
    }
    Ok(())
}

fn compile_sources(dir: &Path, manifest: &Manifest) -> Result<Bytecode> {
    let first = manifest
        .sources
        .first()
        .ok_or_else(|| RuntimeError::from(LoadError::InvalidManifest("module declares no sources".to_owned())))?;
    let full = dir.join(first);
    let bytes = fs::read(&full).map_err(LoadError::from)?;
    if full.extension().and_then(|e| e.to_str()) == Some("phir") {
        let source = String::from_utf8(bytes)
            .map_err(|_| RuntimeError::from(LoadError::MalformedSyntax { line: 0, detail: "source is not valid UTF-8".to_owned() }))?;
        Ok(text::decode(&source)?)
    } else {
        Ok(binary::decode(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasor_isa::{Instruction, Opcode};
    use std::io::Write;

    fn write_bytecode_file(dir: &Path, name: &str, bc: &Bytecode) -> PathBuf {
        let path = dir.join(name);
        let bytes = binary::encode(bc).unwrap();
        fs::write(&path, bytes).unwrap();
        path
    }

    fn write_manifest(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn greet_module() -> Bytecode {
        let mut bc = Bytecode::new();
        let hello = bc.intern_constant(Value::String("hi".to_owned()));
        bc.function_entries.insert("greet".to_owned(), 0);
        bc.function_param_counts.insert("greet".to_owned(), 0);
        bc.emit(Instruction::with_operand(Opcode::PushConst, hello as i32));
        bc.emit(Instruction::new(Opcode::Return));
        bc.emit(Instruction::new(Opcode::Halt));
        bc
    }

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("phasor-module-test-{label}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_module_caches_a_repeat_load_with_no_file_change() {
        let dir = scratch_dir("cache-hit");
        write_bytecode_file(&dir, "greet.phsb", &greet_module());
        let manifest_path = write_manifest(
            &dir,
            "greet.manifest.json",
            r#"{"name":"greet","sources":["greet.phsb"],"checksums":["SKIP"],"lazy":true}"#,
        );

        let mut runtime = ModuleRuntime::new();
        let a = runtime.load_module(&manifest_path, InstanceHandle::NULL).unwrap();
        let b = runtime.load_module(&manifest_path, InstanceHandle::NULL).unwrap();
        assert_eq!(a, b);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_module_invalidates_the_cache_once_the_file_is_touched() {
        let dir = scratch_dir("cache-stale");
        write_bytecode_file(&dir, "greet.phsb", &greet_module());
        let manifest_path = write_manifest(
            &dir,
            "greet.manifest.json",
            r#"{"name":"greet","sources":["greet.phsb"],"checksums":["SKIP"],"lazy":true}"#,
        );

        let mut runtime = ModuleRuntime::new();
        let a = runtime.load_module(&manifest_path, InstanceHandle::NULL).unwrap();

        // Filesystem timestamp resolution makes a single back-to-back
        // rewrite an unreliable staleness signal, so poll until the mtime
        // has actually advanced past its original value.
        let original = fs::metadata(&manifest_path).unwrap().modified().unwrap();
        let contents = fs::read(&manifest_path).unwrap();
        for _ in 0..40 {
            std::thread::sleep(std::time::Duration::from_millis(30));
            fs::write(&manifest_path, &contents).unwrap();
            if fs::metadata(&manifest_path).unwrap().modified().unwrap() > original {
                break;
            }
        }

        let b = runtime.load_module(&manifest_path, InstanceHandle::NULL).unwrap();
        assert_ne!(a, b);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn call_trans_rejects_an_instance_outside_the_caller_imports() {
        let mut runtime = ModuleRuntime::new();
        let a = runtime.vm_mut().create_instance();
        let b = runtime.vm_mut().create_instance();
        let err = runtime.call_trans(a, b, "anything", vec![]).unwrap_err();
        assert_eq!(err.reason(), PanicReason::ModuleAccessViolation);
    }
}
