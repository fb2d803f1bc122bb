use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use bridge::engine::MIN_SUPPORTED_RELEASE;
use bridge::methods::{FIT_LIGAND, VERSION_INFO, WORKING_DIR};
use bridge::protocol::JsonMap;
use bridge::{BridgeContext, RemoteStub};
use serde_json::{json, Value};
use tracing::info;

use crate::cli::{BatchArgs, CallArgs, Commands, FitLigandArgs, RestraintsArgs};

pub async fn execute(context: &mut BridgeContext, command: Commands) -> anyhow::Result<Value> {
    match command {
        Commands::Methods => list_methods(context).await,
        Commands::Version => version(context).await,
        Commands::WorkingDir => {
            let result = context.call(WORKING_DIR, Vec::new(), JsonMap::new()).await?;
            Ok(Value::Object(result))
        }
        Commands::Restraints(args) => restraints(context, args).await,
        Commands::FitLigand(args) => fit_ligand(context, args).await,
        Commands::Call(args) => call(context, args).await,
        Commands::Batch(args) => batch(context, args).await,
    }
}

async fn list_methods(context: &mut BridgeContext) -> anyhow::Result<Value> {
    let client = context.connected_client().await?;
    let mut methods = JsonMap::new();
    for stub in client.methods() {
        methods.insert(stub.name().to_string(), describe_stub(stub)?);
    }
    Ok(Value::Object(methods))
}

/// Wire descriptor of `stub` with its one-line signature added.
fn describe_stub(stub: &RemoteStub) -> anyhow::Result<Value> {
    let mut described = serde_json::to_value(stub.descriptor())?;
    if let Value::Object(fields) = &mut described {
        fields.insert(
            "signature".to_string(),
            json!(stub.descriptor().signature_line()),
        );
    }
    Ok(described)
}

async fn version(context: &mut BridgeContext) -> anyhow::Result<Value> {
    let mut result = context.call(VERSION_INFO, Vec::new(), JsonMap::new()).await?;
    if let Some(release) = context.engine_release() {
        result.insert("release".to_string(), json!(release));
    }
    Ok(Value::Object(result))
}

async fn restraints(context: &mut BridgeContext, args: RestraintsArgs) -> anyhow::Result<Value> {
    let dir = absolute_dir(args.dir)?;
    let filename = context.fetch_restraints(&args.ligand_id, &dir).await?;
    Ok(json!({ "filename": filename.to_string_lossy() }))
}

async fn fit_ligand(context: &mut BridgeContext, args: FitLigandArgs) -> anyhow::Result<Value> {
    context.connected_client().await?;
    context.require_engine_release(MIN_SUPPORTED_RELEASE)?;

    let dir = absolute_dir(args.dir)?;
    let restraints = context.fetch_restraints(&args.ligand_id, &dir).await?;
    info!(restraints = %restraints.display(), "fitting ligand");

    let mut kwargs = JsonMap::new();
    kwargs.insert("working_dir".to_string(), path_value(&dir));
    kwargs.insert("map_file".to_string(), path_value(&existing(&args.map)?));
    kwargs.insert("model_file".to_string(), path_value(&existing(&args.model)?));
    kwargs.insert("ligand_restraint_file".to_string(), path_value(&restraints));
    kwargs.insert("ligand_coord_file".to_string(), path_value(&existing(&args.ligand_coords)?));
    kwargs.insert("resolution".to_string(), json!(args.resolution));
    kwargs.insert("is_xray_map".to_string(), json!(args.xray));
    kwargs.insert("thoroughness".to_string(), json!(args.thoroughness));
    let result = context.call(FIT_LIGAND, Vec::new(), kwargs).await?;
    Ok(Value::Object(result))
}

async fn call(context: &mut BridgeContext, args: CallArgs) -> anyhow::Result<Value> {
    let positional = args.args.iter().map(|raw| parse_json_arg(raw)).collect();
    let kwargs = args
        .kwargs
        .iter()
        .map(|raw| parse_kwarg(raw))
        .collect::<anyhow::Result<JsonMap>>()?;
    let result = context.call(&args.method, positional, kwargs).await?;
    Ok(Value::Object(result))
}

async fn batch(context: &mut BridgeContext, args: BatchArgs) -> anyhow::Result<Value> {
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("reading batch file {}", args.file.display()))?;
    let commands = parse_batch(&text)?;
    let client = context.connected_client().await?;
    Ok(Value::Object(client.call_batch(commands).await?))
}

/// JSON when it parses, otherwise the raw text as a string.
pub fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn parse_kwarg(raw: &str) -> anyhow::Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("keyword argument '{raw}' must look like NAME=JSON"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("keyword argument '{raw}' has an empty name");
    }
    Ok((name.to_string(), parse_json_arg(value)))
}

pub fn parse_batch(text: &str) -> anyhow::Result<Vec<(String, Vec<Value>, JsonMap)>> {
    let entries: Vec<(String, Vec<Value>, JsonMap)> = serde_json::from_str(text)
        .context("batch file must be a JSON array of [name, [args], {kwargs}] entries")?;
    Ok(entries)
}

fn absolute_dir(dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir,
        None => env::current_dir()?,
    };
    fs::canonicalize(&dir).with_context(|| format!("directory {} does not exist", dir.display()))
}

fn existing(path: &Path) -> anyhow::Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("{} does not exist", path.display()))
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge::{MethodDescriptor, MethodSignature, Param};

    #[test]
    fn method_listing_carries_signatures() {
        let signature = MethodSignature::new("Look up restraints.")
            .param(Param::required("code"))
            .param(Param::optional("working_dir", "/tmp"));
        let stub = RemoteStub::new(MethodDescriptor::from_signature("find_cif_file", &signature));
        let described = describe_stub(&stub).unwrap();
        assert_eq!(
            described["signature"],
            json!("find_cif_file(code: 'unspecified', working_dir: 'unspecified' = \"/tmp\")")
        );
        assert_eq!(described["docstring"], json!("Look up restraints."));
        assert_eq!(described["args"], json!([["code", "unspecified"]]));
    }

    #[test]
    fn bare_words_become_strings() {
        assert_eq!(parse_json_arg("3.5"), json!(3.5));
        assert_eq!(parse_json_arg("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_json_arg("\"quoted\""), json!("quoted"));
        assert_eq!(parse_json_arg("ATP"), json!("ATP"));
    }

    #[test]
    fn kwargs_need_a_name() {
        assert_eq!(
            parse_kwarg("resolution=2.5").unwrap(),
            ("resolution".to_string(), json!(2.5))
        );
        assert_eq!(
            parse_kwarg("thoroughness=quick").unwrap(),
            ("thoroughness".to_string(), json!("quick"))
        );
        assert!(parse_kwarg("novalue").is_err());
        assert!(parse_kwarg("=1").is_err());
    }

    #[test]
    fn batch_files_are_triples() {
        let commands =
            parse_batch(r#"[["working_dir", [], {}], ["find_cif_file", ["ATP"], {"working_dir": "/w"}]]"#)
                .unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].0, "find_cif_file");
        assert_eq!(commands[1].2["working_dir"], json!("/w"));
        assert!(parse_batch(r#"[["working_dir"]]"#).is_err());
    }
}
