use crate::errors::PipelineError;
use crate::forge_config::PipelineConfig;

/// `forge-pipeline config-template`: prints an annotated `pipeline.toml`
/// covering every recognized key, for the user to drop at
/// `.forge/pipeline.toml` and edit.
pub fn cmd_config_template() -> Result<(), PipelineError> {
    print!("{}", PipelineConfig::render_template());
    Ok(())
}
