//! Built-in server methods. Their names and result keys are part of the
//! wire contract.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tracing::info;

use crate::descriptor::{MethodSignature, Param};
use crate::engine::EngineRunner;
use crate::errors::{MethodError, MethodResult};
use crate::paths::{
    ensure_absolute_dir, ensure_existing_file, resolve, restraint_file_name,
    validate_component_code,
};
use crate::protocol::JsonMap;
use crate::registry::{MethodCall, MethodRegistry, ServerMethod};
use crate::workdir::JobScope;

pub const VERSION_INFO: &str = "version_info";
pub const WORKING_DIR: &str = "working_dir";
pub const FIND_CIF_FILE: &str = "find_cif_file";
pub const FIT_LIGAND: &str = "fit_ligand";

pub const FITTED_LIGAND_FILE: &str = "fitted_ligand.pdb";
pub const THOROUGHNESS_LEVELS: [&str; 4] = ["quick", "medium", "thorough", "extra_thorough"];
const GOOD_ENOUGH_SCORE: f64 = 0.75;

pub fn register_builtin_methods(registry: &mut MethodRegistry, runner: EngineRunner) {
    let runner = Arc::new(runner);
    registry.register(
        VERSION_INFO,
        Arc::new(VersionInfo {
            runner: runner.clone(),
        }),
    );
    registry.register(
        FIND_CIF_FILE,
        Arc::new(FindCifFile {
            runner: runner.clone(),
        }),
    );
    registry.register(WORKING_DIR, Arc::new(WorkingDir));
    registry.register(FIT_LIGAND, Arc::new(FitLigand { runner }));
}

fn single(key: &str, value: Value) -> JsonMap {
    let mut result = JsonMap::new();
    result.insert(key.to_string(), value);
    result
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().to_string())
}

struct VersionInfo {
    runner: Arc<EngineRunner>,
}

#[async_trait]
impl ServerMethod for VersionInfo {
    fn signature(&self) -> MethodSignature {
        MethodSignature::new("Report the installed engine version and its release tag.")
    }

    async fn invoke(&self, _call: MethodCall) -> MethodResult {
        let version = self.runner.version().await?;
        let mut result = JsonMap::new();
        result.insert("version".to_string(), json!(version.version));
        result.insert("tag".to_string(), json!(version.tag));
        Ok(result)
    }
}

struct WorkingDir;

#[async_trait]
impl ServerMethod for WorkingDir {
    fn signature(&self) -> MethodSignature {
        MethodSignature::new("Absolute path of the server's current working directory.")
    }

    async fn invoke(&self, _call: MethodCall) -> MethodResult {
        let dir = env::current_dir()?;
        Ok(single("dir", path_value(&dir)))
    }
}

struct FindCifFile {
    runner: Arc<EngineRunner>,
}

impl FindCifFile {
    fn library_candidates(&self, code: &str) -> Vec<PathBuf> {
        let code = code.to_ascii_uppercase();
        let Some(first) = code.chars().next() else {
            return Vec::new();
        };
        let shard = first.to_ascii_lowercase().to_string();
        self.runner
            .config()
            .restraint_libraries
            .iter()
            .flat_map(|library| {
                [
                    library.join(&shard).join(format!("data_{code}.cif")),
                    library.join(&shard).join(format!("{code}.cif")),
                ]
            })
            .collect()
    }

    async fn generate(&self, code: &str, target: &Path) -> Result<(), MethodError> {
        let generator = self.runner.config().restraint_generator.clone();
        let scope = JobScope::new()?;
        let args = vec!["--chemical_component".to_string(), code.to_string()];
        if let Err(err) = self.runner.run(&generator, &args, scope.path()).await {
            return Err(MethodError::engine(format!(
                "Tried to generate restraints for ligand {code} with {generator}, but it failed \
                 with the below error message. Please generate restraints externally, and save \
                 in your working directory as {}.\n\nError message:\n{err}",
                restraint_file_name(code)
            )));
        }
        let generated = scope.path().join(format!("{code}.cif"));
        if !generated.is_file() {
            return Err(MethodError::engine(format!(
                "{generator} finished without writing {}",
                generated.display()
            )));
        }
        fs::copy(&generated, target).await?;
        scope.close()?;
        Ok(())
    }
}

#[async_trait]
impl ServerMethod for FindCifFile {
    fn signature(&self) -> MethodSignature {
        MethodSignature::new(
            "Provide restraints for a chemical component as <code>_restraints.cif in \
             working_dir, reusing an existing file, copying one from the restraint \
             libraries, or generating it with the restraint generator.",
        )
        .param(Param::required("code"))
        .param(Param::required("working_dir"))
    }

    async fn invoke(&self, call: MethodCall) -> MethodResult {
        let code = validate_component_code(call.str("code")?)?.to_string();
        let working_dir = ensure_absolute_dir(call.str("working_dir")?)?;
        let target = resolve(&working_dir, restraint_file_name(&code))?;

        if target.is_file() {
            info!(code = %code, path = %target.display(), "restraints already present");
            return Ok(single("filename", path_value(&target)));
        }

        let library_hit = self
            .library_candidates(&code)
            .into_iter()
            .find(|candidate| candidate.is_file());
        match library_hit {
            Some(source) => {
                info!(code = %code, source = %source.display(), "copying library restraints");
                fs::copy(&source, &target).await?;
            }
            None => {
                info!(code = %code, "generating restraints");
                self.generate(&code, &target).await?;
            }
        }
        Ok(single("filename", path_value(&target)))
    }
}

struct FitLigand {
    runner: Arc<EngineRunner>,
}

#[derive(Debug)]
struct FitLigandJob {
    map_file: PathBuf,
    model_file: PathBuf,
    restraint_file: PathBuf,
    ligand_file: PathBuf,
    output_file: PathBuf,
    resolution: f64,
    is_xray_map: bool,
    nproc: u64,
    thoroughness: String,
}

impl FitLigandJob {
    fn from_call(call: &MethodCall) -> Result<Self, MethodError> {
        let working_dir = ensure_absolute_dir(call.str("working_dir")?)?;
        let resolution = call.f64("resolution")?;
        if resolution.is_nan() || resolution <= 0.0 {
            return Err(MethodError::value(format!(
                "resolution must be positive, got {resolution}"
            )));
        }
        let nproc = call.u64("nproc")?;
        if nproc == 0 {
            return Err(MethodError::value("nproc must be at least 1"));
        }
        let thoroughness = call.str("thoroughness")?;
        if !THOROUGHNESS_LEVELS.contains(&thoroughness) {
            return Err(MethodError::value(format!(
                "thoroughness must be one of {}, got '{thoroughness}'",
                THOROUGHNESS_LEVELS.join(", ")
            )));
        }
        Ok(Self {
            map_file: ensure_existing_file("map file", call.str("map_file")?)?,
            model_file: ensure_existing_file("model file", call.str("model_file")?)?,
            restraint_file: ensure_existing_file(
                "ligand restraint file",
                call.str("ligand_restraint_file")?,
            )?,
            ligand_file: ensure_existing_file(
                "ligand coordinate file",
                call.str("ligand_coord_file")?,
            )?,
            output_file: resolve(&working_dir, FITTED_LIGAND_FILE)?,
            resolution,
            is_xray_map: call.bool("is_xray_map")?,
            nproc,
            thoroughness: thoroughness.to_string(),
        })
    }

    fn script(&self) -> Result<String, MethodError> {
        let literal = |path: &Path| serde_json::to_string(&path.to_string_lossy());
        let scattering_table = if self.is_xray_map {
            "n_gaussian"
        } else {
            "electron"
        };
        Ok(format!(
            r#"from iotbx.data_manager import DataManager
from iotbx.map_model_manager import map_model_manager
from phenix.model_building import local_model_building

dm = DataManager()
map_manager = dm.get_real_map({map_file})
model = dm.get_model({model_file})
mmm = map_model_manager(map_manager=map_manager, wrapping=False, model=model)
mmm.remove_model_outside_map(boundary=1.5)

ligand_model = dm.get_model({ligand_file})
dm.process_restraint_file({restraint_file})
restraints = dm.get_restraint({restraint_file})

builder = local_model_building(
    map_model_manager=mmm,
    resolution={resolution:?},
    is_xray_map={is_xray_map},
    nproc={nproc},
)
builder.set_defaults(scattering_table={scattering_table}, thoroughness={thoroughness})
fitted = builder.fit_ligand(
    ligand_model=ligand_model,
    restraints_object=restraints,
    good_enough_score={good_enough:?},
)
if fitted is None:
    raise SystemExit("no acceptable ligand placement was found")
dm.write_model_file(fitted, {output_file}, overwrite=True)
"#,
            map_file = literal(&self.map_file)?,
            model_file = literal(&self.model_file)?,
            ligand_file = literal(&self.ligand_file)?,
            restraint_file = literal(&self.restraint_file)?,
            output_file = literal(&self.output_file)?,
            resolution = self.resolution,
            is_xray_map = if self.is_xray_map { "True" } else { "False" },
            nproc = self.nproc,
            scattering_table = serde_json::to_string(scattering_table)?,
            thoroughness = serde_json::to_string(&self.thoroughness)?,
            good_enough = GOOD_ENOUGH_SCORE,
        ))
    }
}

#[async_trait]
impl ServerMethod for FitLigand {
    fn signature(&self) -> MethodSignature {
        MethodSignature::new(
            "Fit a ligand into a density map around a model fragment and write the \
             result to working_dir/fitted_ligand.pdb. All file arguments are absolute \
             paths readable by the server.",
        )
        .param(Param::required("working_dir"))
        .param(Param::required("map_file"))
        .param(Param::required("model_file"))
        .param(Param::required("ligand_restraint_file"))
        .param(Param::required("ligand_coord_file"))
        .param(Param::optional("resolution", 3.0))
        .param(Param::optional("is_xray_map", false))
        .param(Param::optional("nproc", 4))
        .param(Param::optional("thoroughness", "medium"))
    }

    async fn invoke(&self, call: MethodCall) -> MethodResult {
        let job = FitLigandJob::from_call(&call)?;
        let script = job.script()?;

        let scope = JobScope::new()?;
        self.runner.run_script(scope.path(), &script).await?;
        if !job.output_file.is_file() {
            return Err(MethodError::engine(format!(
                "ligand fitting finished without writing {}",
                job.output_file.display()
            )));
        }
        scope.close()?;
        Ok(single("ligand_file", path_value(&job.output_file)))
    }
}
