use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, ensure};
use burn::{backend::NdArray, module::Module, tensor::backend::Backend};
use burn_disambiguation::model::{
    backbone::{BackboneConfig, BackboneVariant},
    depth::DepthHeadConfig,
    encoder::DepthGuidedEncoder,
    interpolate::DepthResample,
};
use burn_store::{
    ApplyResult, KeyRemapper, ModuleSnapshot, PyTorchToBurnAdapter, SafetensorsStore,
};
use clap::{Parser, ValueEnum};

type ImportBackend = NdArray<f32>;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Convert Depth-Anything style DINOv2 + DPT safetensors into the two Burn records `train` loads"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = VariantArg::Base)]
    variant: VariantArg,

    #[arg(long, value_name = "PATH")]
    checkpoint: PathBuf,

    /// Key prefix of the DINOv2 tensors inside the checkpoint.
    #[arg(long, default_value = "pretrained")]
    backbone_prefix: String,

    /// Key prefix of the DPT head tensors inside the checkpoint.
    #[arg(long, default_value = "depth_head")]
    head_prefix: String,

    /// Resolution the checkpoint's position embeddings were trained at.
    #[arg(long, value_name = "PX", default_value_t = 518)]
    image_size: usize,

    #[arg(long, value_name = "PATH")]
    backbone_output: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    depth_output: Option<PathBuf>,

    #[arg(long, value_name = "BOOL", default_value_t = false)]
    dry_run: bool,

    /// Writes the expected Burn tensor paths of both halves, one per line.
    #[arg(long, value_name = "PATH")]
    dump_template: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum VariantArg {
    Small,
    Base,
    Large,
}

impl VariantArg {
    fn variant(self) -> BackboneVariant {
        match self {
            VariantArg::Small => BackboneVariant::Small,
            VariantArg::Base => BackboneVariant::Base,
            VariantArg::Large => BackboneVariant::Large,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            VariantArg::Small => "vits",
            VariantArg::Base => "vitb",
            VariantArg::Large => "vitl",
        }
    }

    fn default_backbone_output(self) -> PathBuf {
        PathBuf::from(format!("assets/model/dinov2_{}_backbone.mpk", self.tag()))
    }

    fn default_depth_output(self) -> PathBuf {
        PathBuf::from(format!("assets/model/dinov2_{}_depth_head.mpk", self.tag()))
    }
}

/// Strips `prefix.` and renames PyTorch layer norm affine tensors to burn's names.
fn backbone_remapper(prefix: &str) -> Result<KeyRemapper> {
    let prefix = regex_prefix(prefix);
    Ok(KeyRemapper::new()
        .add_pattern(&format!(r"^{prefix}"), "")?
        .add_pattern(r"^(blocks\.\d+\.norm\d+)\.weight$", "$1.gamma")?
        .add_pattern(r"^(blocks\.\d+\.norm\d+)\.bias$", "$1.beta")?
        .add_pattern(r"^norm\.weight$", "norm.gamma")?
        .add_pattern(r"^norm\.bias$", "norm.beta")?)
}

/// Strips `prefix.` and maps the DPT `nn.Sequential` indices onto named fields.
fn head_remapper(prefix: &str) -> Result<KeyRemapper> {
    let prefix = regex_prefix(prefix);
    Ok(KeyRemapper::new()
        .add_pattern(&format!(r"^{prefix}"), "")?
        .add_pattern(r"^(resize_layers\.(0|1))\.(weight|bias)$", "$1.conv_t.$3")?
        .add_pattern(r"^(resize_layers\.3)\.(weight|bias)$", "$1.conv.$2")?
        .add_pattern(r"^(scratch\.output_conv2)\.0\.(weight|bias)$", "$1.conv1.$2")?
        .add_pattern(r"^(scratch\.output_conv2)\.2\.(weight|bias)$", "$1.conv2.$2")?
        .add_pattern(r"^(scratch\.refinenet\d+)\.resConfUnit1\.", "$1.residual1.")?
        .add_pattern(r"^(scratch\.refinenet\d+)\.resConfUnit2\.", "$1.residual2.")?)
}

fn regex_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        String::new()
    } else {
        format!(r"{}\.", prefix.replace('.', r"\."))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    ensure!(
        args.checkpoint.exists(),
        "checkpoint `{}` not found",
        args.checkpoint.display()
    );
    let backbone_output = args
        .backbone_output
        .clone()
        .unwrap_or_else(|| args.variant.default_backbone_output());
    let depth_output = args
        .depth_output
        .clone()
        .unwrap_or_else(|| args.variant.default_depth_output());

    let device = <ImportBackend as Backend>::Device::default();
    let variant = args.variant.variant();
    let backbone = BackboneConfig::new()
        .with_variant(variant.clone())
        .with_image_size(args.image_size)
        .init::<ImportBackend>(&device);
    let mut head =
        DepthHeadConfig::for_variant(&variant).init::<ImportBackend>(&device, variant.embed_dim());

    if let Some(path) = &args.dump_template {
        let mut paths = template_paths(backbone.vit(), &args.backbone_prefix);
        paths.extend(template_paths(&head, &args.head_prefix));
        std::fs::write(path, paths.join("\n"))
            .with_context(|| format!("failed to write template `{}`", path.display()))?;
        println!("Wrote template paths to {}", path.display());
        if args.dry_run {
            return Ok(());
        }
    }

    println!("Loading {}", args.checkpoint.display());
    let mut vit = backbone.vit().clone();
    let result = vit
        .load_from(&mut open_store(&args.checkpoint, backbone_remapper(&args.backbone_prefix)?))
        .map_err(|err| anyhow!("failed to apply backbone tensors: {err}"))?;
    report_result("backbone", &result);

    let result = head
        .load_from(&mut open_store(&args.checkpoint, head_remapper(&args.head_prefix)?))
        .map_err(|err| anyhow!("failed to apply depth head tensors: {err}"))?;
    report_result("depth head", &result);

    if args.dry_run {
        println!("Dry run enabled; checkpoints not written.");
        return Ok(());
    }

    let encoder =
        DepthGuidedEncoder::from_parts(backbone.with_vit(vit), head, DepthResample::Bilinear);
    encoder
        .save_weights(&backbone_output, &depth_output)
        .context("failed to save converted weights")?;
    println!(
        "Saved Burn checkpoints to {} and {}",
        backbone_output.display(),
        depth_output.display()
    );
    Ok(())
}

fn open_store(checkpoint: &Path, remapper: KeyRemapper) -> SafetensorsStore {
    SafetensorsStore::from_file(checkpoint)
        .remap(remapper)
        .with_from_adapter(PyTorchToBurnAdapter::default())
        .allow_partial(true)
}

fn report_result(component: &str, result: &ApplyResult) {
    println!(
        "{component}: applied {} tensors ({} skipped, {} missing, {} unused).",
        result.applied.len(),
        result.skipped.len(),
        result.missing.len(),
        result.unused.len()
    );
    for key in &result.missing {
        println!("Missing tensor: {key}");
    }
    for key in &result.unused {
        println!("Unused tensor: {key}");
    }
}

fn template_paths<B: Backend, M: Module<B> + Clone>(module: &M, prefix: &str) -> Vec<String> {
    let mut paths: Vec<String> = module
        .clone()
        .collect(None, None)
        .into_iter()
        .map(|snapshot| match prefix {
            "" => snapshot.full_path(),
            prefix => format!("{prefix}.{}", snapshot.full_path()),
        })
        .collect();
    paths.sort();
    paths
}
