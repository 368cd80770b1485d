mod executor;
mod patch;

pub use executor::{
    run_effects_for_trigger, EffectDef, EffectPhase, EffectRun, PHASE_ORDER,
};
pub use patch::{apply_patch, PatchError, PatchOp};
