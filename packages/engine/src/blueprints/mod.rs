//! Blueprint implementations shipped with the engine.
//!
//! `testing` holds the echo/sleep/orchestrator blueprints used to validate
//! queueing and DAG behavior end to end; `pack_install` holds the
//! installer-class blueprints that exercise advisory locking and idempotent
//! finalization. Business blueprints live outside the engine and register
//! themselves the same way.

pub mod pack_install;
pub mod testing;

use crate::registry::BlueprintRegistry;

/// Register every built-in blueprint.
///
/// Must run before any worker loop starts.
pub fn register_all(registry: &mut BlueprintRegistry) {
    testing::register(registry);
    pack_install::register(registry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_all_registers_builtins() {
        let mut registry = BlueprintRegistry::new();
        register_all(&mut registry);

        assert!(registry.is_registered("core.test.echo@v1"));
        assert!(registry.is_registered("core.test.sleep@v1"));
        assert!(registry.is_registered("core.test.orchestrator@v1"));
        assert!(registry.is_registered("core.pack.install@v1"));
        assert!(registry.is_registered("core.pack.system.install@v1"));
        assert!(registry.is_registered("core.migrations.apply@v1"));
    }
}
