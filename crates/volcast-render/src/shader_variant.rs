use std::collections::{BTreeMap, HashMap};
use std::fmt;

use volcast_core::error::RenderError;
use volcast_core::types::{BlendMode, MaskKind};

use crate::backend::GpuBackend;

/// Camera projection selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Projection {
    Parallel,
    Perspective,
}

/// Ray integration method. The four-component and mask variants read extra
/// textures and integrate differently, so each one is its own trace stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RayMethod {
    Composite,
    CompositeBinaryMask,
    CompositeLabelMask,
    Mip,
    MipBinaryMask,
    MipFourDependent,
    MinIp,
    MinIpBinaryMask,
    MinIpFourDependent,
    Additive,
}

/// Methods grouped by how partial results combine across passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodFamily {
    Composite,
    Mip,
    MinIp,
    Additive,
}

impl RayMethod {
    pub fn family(self) -> MethodFamily {
        match self {
            RayMethod::Composite | RayMethod::CompositeBinaryMask | RayMethod::CompositeLabelMask => {
                MethodFamily::Composite
            }
            RayMethod::Mip | RayMethod::MipBinaryMask | RayMethod::MipFourDependent => {
                MethodFamily::Mip
            }
            RayMethod::MinIp | RayMethod::MinIpBinaryMask | RayMethod::MinIpFourDependent => {
                MethodFamily::MinIp
            }
            RayMethod::Additive => MethodFamily::Additive,
        }
    }

    pub fn uses_mask(self) -> bool {
        matches!(
            self,
            RayMethod::CompositeBinaryMask
                | RayMethod::CompositeLabelMask
                | RayMethod::MipBinaryMask
                | RayMethod::MinIpBinaryMask
        )
    }

    pub fn uses_label_colors(self) -> bool {
        self == RayMethod::CompositeLabelMask
    }

    fn trace_key(self) -> &'static str {
        match self {
            RayMethod::Composite => "trace/composite",
            RayMethod::CompositeBinaryMask => "trace/composite-binary-mask",
            RayMethod::CompositeLabelMask => "trace/composite-label-mask",
            RayMethod::Mip => "trace/mip",
            RayMethod::MipBinaryMask => "trace/mip-binary-mask",
            RayMethod::MipFourDependent => "trace/mip-four-dependent",
            RayMethod::MinIp => "trace/minip",
            RayMethod::MinIpBinaryMask => "trace/minip-binary-mask",
            RayMethod::MinIpFourDependent => "trace/minip-four-dependent",
            RayMethod::Additive => "trace/additive",
        }
    }

    const ALL: [RayMethod; 10] = [
        RayMethod::Composite,
        RayMethod::CompositeBinaryMask,
        RayMethod::CompositeLabelMask,
        RayMethod::Mip,
        RayMethod::MipBinaryMask,
        RayMethod::MipFourDependent,
        RayMethod::MinIp,
        RayMethod::MinIpBinaryMask,
        RayMethod::MinIpFourDependent,
        RayMethod::Additive,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentMode {
    One,
    Four,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shading {
    On,
    Off,
    NotApplicable,
}

/// The complete selector of the active ray-cast program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderVariant {
    pub projection: Projection,
    pub method: RayMethod,
    pub cropping: bool,
    pub shading: Shading,
    pub components: ComponentMode,
}

/// Render configuration the variant is derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariantRequest {
    pub blend: BlendMode,
    pub components: u32,
    pub mask: Option<MaskKind>,
    pub shade: bool,
    pub parallel: bool,
    pub cropping: bool,
}

/// (blend, components, mask) -> method. Combinations missing here are unsupported.
const METHOD_TABLE: &[(BlendMode, u32, Option<MaskKind>, RayMethod)] = &[
    (BlendMode::Composite, 1, None, RayMethod::Composite),
    (BlendMode::Composite, 4, None, RayMethod::Composite),
    (BlendMode::Composite, 1, Some(MaskKind::Binary), RayMethod::CompositeBinaryMask),
    (BlendMode::Composite, 4, Some(MaskKind::Binary), RayMethod::CompositeBinaryMask),
    (BlendMode::Composite, 1, Some(MaskKind::LabelMap), RayMethod::CompositeLabelMask),
    (BlendMode::MaximumIntensity, 1, None, RayMethod::Mip),
    (BlendMode::MaximumIntensity, 4, None, RayMethod::MipFourDependent),
    (BlendMode::MaximumIntensity, 1, Some(MaskKind::Binary), RayMethod::MipBinaryMask),
    (BlendMode::MinimumIntensity, 1, None, RayMethod::MinIp),
    (BlendMode::MinimumIntensity, 4, None, RayMethod::MinIpFourDependent),
    (BlendMode::MinimumIntensity, 1, Some(MaskKind::Binary), RayMethod::MinIpBinaryMask),
    (BlendMode::Additive, 1, None, RayMethod::Additive),
];

impl ShaderVariant {
    /// Resolve the variant for a render configuration.
    pub fn select(request: &VariantRequest) -> Result<Self, RenderError> {
        let method = METHOD_TABLE
            .iter()
            .find(|(blend, comps, mask, _)| {
                *blend == request.blend && *comps == request.components && *mask == request.mask
            })
            .map(|(_, _, _, method)| *method)
            .ok_or_else(|| {
                RenderError::InvalidConfiguration(format!(
                    "{:?} blending with {} component(s) and mask {:?}",
                    request.blend, request.components, request.mask
                ))
            })?;

        let shading = match (method.family(), request.shade) {
            (MethodFamily::Composite, true) => Shading::On,
            (MethodFamily::Composite, false) => Shading::Off,
            _ => Shading::NotApplicable,
        };

        Ok(Self {
            projection: if request.parallel {
                Projection::Parallel
            } else {
                Projection::Perspective
            },
            method,
            cropping: request.cropping,
            shading,
            components: if request.components == 4 {
                ComponentMode::Four
            } else {
                ComponentMode::One
            },
        })
    }

    /// Same variant with the cropping (multi-pass compositing) stage switched.
    pub fn with_cropping(mut self, cropping: bool) -> Self {
        self.cropping = cropping;
        self
    }
}

/// Program stages in link order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Base,
    Projection,
    Trace,
    Cropping,
    Component,
    Shade,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 6] = [
        ShaderStage::Base,
        ShaderStage::Projection,
        ShaderStage::Trace,
        ShaderStage::Cropping,
        ShaderStage::Component,
        ShaderStage::Shade,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Registry key of one stage's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderKey(pub &'static str);

impl fmt::Display for ShaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Source text lookup. The mapper only chooses keys.
pub trait ShaderSourceRegistry {
    fn source(&self, key: ShaderKey) -> Option<String>;
}

/// In-memory registry populated by the host.
#[derive(Debug, Default, Clone)]
pub struct ShaderLibrary {
    sources: HashMap<&'static str, String>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &'static str, source: impl Into<String>) {
        self.sources.insert(key, source.into());
    }

    /// The WGSL stages shipped with the crate, keyed for every variant.
    pub fn builtin() -> Self {
        let mut library = Self::new();
        for &(key, source) in BUILTIN_STAGES {
            library.insert(key, source);
        }
        library
    }

    /// Every key any variant can request, each mapped to a placeholder that names it.
    pub fn with_placeholders() -> Self {
        let mut library = Self::new();
        for key in VariantTable::new().all_keys() {
            library.insert(key.0, format!("// {key}\n"));
        }
        library
    }
}

const CROPPING_ON: &str = include_str!("../../../shaders/render/raycast/cropping_on.wgsl");
const CROPPING_OFF: &str = include_str!("../../../shaders/render/raycast/cropping_off.wgsl");

const BUILTIN_STAGES: &[(&str, &str)] = &[
    ("base/main", include_str!("../../../shaders/render/raycast/base.wgsl")),
    ("projection/parallel", include_str!("../../../shaders/render/raycast/projection_parallel.wgsl")),
    ("projection/perspective", include_str!("../../../shaders/render/raycast/projection_perspective.wgsl")),
    ("trace/composite", include_str!("../../../shaders/render/raycast/trace_composite.wgsl")),
    ("trace/composite-binary-mask", include_str!("../../../shaders/render/raycast/trace_composite_binary_mask.wgsl")),
    ("trace/composite-label-mask", include_str!("../../../shaders/render/raycast/trace_composite_label_mask.wgsl")),
    ("trace/mip", include_str!("../../../shaders/render/raycast/trace_mip.wgsl")),
    ("trace/mip-binary-mask", include_str!("../../../shaders/render/raycast/trace_mip_binary_mask.wgsl")),
    ("trace/mip-four-dependent", include_str!("../../../shaders/render/raycast/trace_mip_four_dependent.wgsl")),
    ("trace/minip", include_str!("../../../shaders/render/raycast/trace_minip.wgsl")),
    ("trace/minip-binary-mask", include_str!("../../../shaders/render/raycast/trace_minip_binary_mask.wgsl")),
    ("trace/minip-four-dependent", include_str!("../../../shaders/render/raycast/trace_minip_four_dependent.wgsl")),
    ("trace/additive", include_str!("../../../shaders/render/raycast/trace_additive.wgsl")),
    // Every family crops the same way: rejected samples never reach the trace.
    ("cropping/composite-on", CROPPING_ON),
    ("cropping/composite-off", CROPPING_OFF),
    ("cropping/mip-on", CROPPING_ON),
    ("cropping/mip-off", CROPPING_OFF),
    ("cropping/minip-on", CROPPING_ON),
    ("cropping/minip-off", CROPPING_OFF),
    ("cropping/additive-on", CROPPING_ON),
    ("cropping/additive-off", CROPPING_OFF),
    ("component/one", include_str!("../../../shaders/render/raycast/component_one.wgsl")),
    ("component/four", include_str!("../../../shaders/render/raycast/component_four.wgsl")),
    ("shade/yes", include_str!("../../../shaders/render/raycast/shade_on.wgsl")),
    ("shade/no", include_str!("../../../shaders/render/raycast/shade_off.wgsl")),
];

impl ShaderSourceRegistry for ShaderLibrary {
    fn source(&self, key: ShaderKey) -> Option<String> {
        self.sources.get(key.0).cloned()
    }
}

/// Stage key per stage; `None` means the stage is absent from the program.
pub type StageKeys = [Option<ShaderKey>; 6];

/// Stage keys of every valid variant, built once.
pub struct VariantTable {
    entries: HashMap<ShaderVariant, StageKeys>,
}

impl VariantTable {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        for projection in [Projection::Parallel, Projection::Perspective] {
            for method in RayMethod::ALL {
                for cropping in [false, true] {
                    for components in [ComponentMode::One, ComponentMode::Four] {
                        let shadings: &[Shading] = if method.family() == MethodFamily::Composite {
                            &[Shading::On, Shading::Off]
                        } else {
                            &[Shading::NotApplicable]
                        };
                        for &shading in shadings {
                            let variant = ShaderVariant {
                                projection,
                                method,
                                cropping,
                                shading,
                                components,
                            };
                            entries.insert(variant, stage_keys(&variant));
                        }
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn keys(&self, variant: &ShaderVariant) -> Option<&StageKeys> {
        self.entries.get(variant)
    }

    /// Every distinct key referenced by the table.
    pub fn all_keys(&self) -> Vec<ShaderKey> {
        let mut keys: Vec<ShaderKey> = self
            .entries
            .values()
            .flat_map(|k| k.iter().flatten().copied())
            .collect();
        keys.sort_by_key(|k| k.0);
        keys.dedup();
        keys
    }
}

impl Default for VariantTable {
    fn default() -> Self {
        Self::new()
    }
}

fn stage_keys(variant: &ShaderVariant) -> StageKeys {
    let family = variant.method.family();
    let projection = match variant.projection {
        Projection::Parallel => "projection/parallel",
        Projection::Perspective => "projection/perspective",
    };
    let cropping = match (family, variant.cropping) {
        (MethodFamily::Composite, true) => "cropping/composite-on",
        (MethodFamily::Composite, false) => "cropping/composite-off",
        (MethodFamily::Mip, true) => "cropping/mip-on",
        (MethodFamily::Mip, false) => "cropping/mip-off",
        (MethodFamily::MinIp, true) => "cropping/minip-on",
        (MethodFamily::MinIp, false) => "cropping/minip-off",
        (MethodFamily::Additive, true) => "cropping/additive-on",
        (MethodFamily::Additive, false) => "cropping/additive-off",
    };
    let component = match (family, variant.components) {
        (MethodFamily::Composite, ComponentMode::One) => Some("component/one"),
        (MethodFamily::Composite, ComponentMode::Four) => Some("component/four"),
        _ => None,
    };
    let shade = match variant.shading {
        Shading::On => Some("shade/yes"),
        Shading::Off => Some("shade/no"),
        Shading::NotApplicable => None,
    };
    [
        Some(ShaderKey("base/main")),
        Some(ShaderKey(projection)),
        Some(ShaderKey(variant.method.trace_key())),
        Some(ShaderKey(cropping)),
        component.map(ShaderKey),
        shade.map(ShaderKey),
    ]
}

/// One stage of a program handed to the backend for linking.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSource {
    pub stage: ShaderStage,
    pub key: ShaderKey,
    pub source: String,
}

/// Complete ordered stage list of a program.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgramSource {
    pub stages: Vec<StageSource>,
}

impl ProgramSource {
    /// Concatenate `preamble` and every stage source in link order.
    pub fn compose(&self, preamble: &str) -> String {
        let mut out = String::from(preamble);
        for stage in &self.stages {
            out.push('\n');
            out.push_str(&stage.source);
        }
        out
    }
}

/// Stage changes produced by one transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageDelta {
    pub added: Vec<ShaderStage>,
    pub replaced: Vec<ShaderStage>,
    pub removed: Vec<ShaderStage>,
}

impl StageDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.replaced.is_empty() && self.removed.is_empty()
    }
}

/// Tracks the active variant and its linked program.
///
/// Each transition swaps only the stages whose key changed and relinks only
/// when something changed. A failed link leaves the program invalid until a
/// later transition links successfully.
pub struct ShaderVariantMachine {
    table: VariantTable,
    active: Option<ShaderVariant>,
    stages: BTreeMap<ShaderStage, StageSource>,
    valid: bool,
    stage_changes: [u64; 6],
    links: u64,
}

impl ShaderVariantMachine {
    pub fn new() -> Self {
        Self {
            table: VariantTable::new(),
            active: None,
            stages: BTreeMap::new(),
            valid: false,
            stage_changes: [0; 6],
            links: 0,
        }
    }

    pub fn active(&self) -> Option<ShaderVariant> {
        self.active
    }

    /// True when the last link succeeded and dispatch may proceed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// How many times `stage` has been added, replaced or removed.
    pub fn stage_changes(&self, stage: ShaderStage) -> u64 {
        self.stage_changes[stage.index()]
    }

    pub fn link_count(&self) -> u64 {
        self.links
    }

    /// Move to `variant`, fetching new stage sources and relinking if any stage changed.
    pub fn transition<B: GpuBackend + ?Sized>(
        &mut self,
        variant: ShaderVariant,
        registry: &dyn ShaderSourceRegistry,
        backend: &mut B,
    ) -> Result<StageDelta, RenderError> {
        let keys = *self.table.keys(&variant).ok_or_else(|| {
            RenderError::InvalidConfiguration(format!("no program for {variant:?}"))
        })?;

        let mut delta = StageDelta::default();
        let mut incoming = Vec::new();
        for stage in ShaderStage::ALL {
            let current = self.stages.get(&stage).map(|s| s.key);
            match (current, keys[stage.index()]) {
                (None, None) => {}
                (Some(_), None) => delta.removed.push(stage),
                (Some(old), Some(new)) if old == new => {}
                (old, Some(new)) => {
                    let source = registry.source(new).ok_or_else(|| {
                        self.valid = false;
                        RenderError::ShaderLink(format!("no source registered for {new}"))
                    })?;
                    if old.is_some() {
                        delta.replaced.push(stage);
                    } else {
                        delta.added.push(stage);
                    }
                    incoming.push(StageSource {
                        stage,
                        key: new,
                        source,
                    });
                }
            }
        }

        self.active = Some(variant);
        if delta.is_empty() {
            return Ok(delta);
        }

        for stage in &delta.removed {
            self.stages.remove(stage);
            self.stage_changes[stage.index()] += 1;
        }
        for source in incoming {
            self.stage_changes[source.stage.index()] += 1;
            self.stages.insert(source.stage, source);
        }

        let program = ProgramSource {
            stages: self.stages.values().cloned().collect(),
        };
        self.links += 1;
        match backend.link_program(&program) {
            Ok(()) => {
                self.valid = true;
                log::debug!(
                    "Relinked volume program: +{:?} ~{:?} -{:?}",
                    delta.added,
                    delta.replaced,
                    delta.removed
                );
                Ok(delta)
            }
            Err(message) => {
                self.valid = false;
                Err(RenderError::ShaderLink(message))
            }
        }
    }

    /// Forget the linked program, e.g. after the graphics context was lost.
    pub fn reset(&mut self) {
        self.active = None;
        self.stages.clear();
        self.valid = false;
    }
}

impl Default for ShaderVariantMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareBackend;

    fn request(blend: BlendMode) -> VariantRequest {
        VariantRequest {
            blend,
            components: 1,
            mask: None,
            shade: true,
            parallel: true,
            cropping: false,
        }
    }

    #[test]
    fn test_select_composite_with_shading() {
        let v = ShaderVariant::select(&request(BlendMode::Composite)).expect("supported");
        assert_eq!(v.method, RayMethod::Composite);
        assert_eq!(v.shading, Shading::On);
        assert_eq!(v.projection, Projection::Parallel);
    }

    #[test]
    fn test_select_mip_has_no_shading() {
        let v = ShaderVariant::select(&request(BlendMode::MaximumIntensity)).expect("supported");
        assert_eq!(v.shading, Shading::NotApplicable);
        let mut four = request(BlendMode::MinimumIntensity);
        four.components = 4;
        let v = ShaderVariant::select(&four).expect("supported");
        assert_eq!(v.method, RayMethod::MinIpFourDependent);
    }

    #[test]
    fn test_select_rejects_four_component_additive() {
        let mut r = request(BlendMode::Additive);
        r.components = 4;
        assert!(matches!(
            ShaderVariant::select(&r),
            Err(RenderError::InvalidConfiguration(_))
        ));
        let mut r = request(BlendMode::MaximumIntensity);
        r.mask = Some(MaskKind::LabelMap);
        assert!(ShaderVariant::select(&r).is_err());
    }

    #[test]
    fn test_table_covers_every_selectable_variant() {
        let table = VariantTable::new();
        for &(blend, components, mask, _) in METHOD_TABLE {
            for shade in [false, true] {
                for cropping in [false, true] {
                    let r = VariantRequest {
                        blend,
                        components,
                        mask,
                        shade,
                        parallel: false,
                        cropping,
                    };
                    let v = ShaderVariant::select(&r).expect("table entry");
                    assert!(table.keys(&v).is_some(), "missing {v:?}");
                }
            }
        }
    }

    #[test]
    fn test_cropping_toggle_replaces_one_stage() {
        let library = ShaderLibrary::with_placeholders();
        let mut backend = SoftwareBackend::new();
        let mut machine = ShaderVariantMachine::new();

        let first = ShaderVariant::select(&request(BlendMode::Composite)).expect("supported");
        let delta = machine
            .transition(first, &library, &mut backend)
            .expect("initial link");
        assert_eq!(delta.added.len(), 6);

        let before: Vec<u64> = ShaderStage::ALL.iter().map(|s| machine.stage_changes(*s)).collect();
        let delta = machine
            .transition(first.with_cropping(true), &library, &mut backend)
            .expect("relink");
        assert_eq!(delta.replaced, vec![ShaderStage::Cropping]);
        assert!(delta.added.is_empty() && delta.removed.is_empty());

        for (i, stage) in ShaderStage::ALL.iter().enumerate() {
            let expected = if *stage == ShaderStage::Cropping { 1 } else { 0 };
            assert_eq!(machine.stage_changes(*stage) - before[i], expected, "{stage:?}");
        }
        assert_eq!(machine.link_count(), 2);
    }

    #[test]
    fn test_unchanged_variant_does_not_relink() {
        let library = ShaderLibrary::with_placeholders();
        let mut backend = SoftwareBackend::new();
        let mut machine = ShaderVariantMachine::new();
        let v = ShaderVariant::select(&request(BlendMode::Composite)).expect("supported");
        machine.transition(v, &library, &mut backend).expect("link");
        let delta = machine.transition(v, &library, &mut backend).expect("no-op");
        assert!(delta.is_empty());
        assert_eq!(machine.link_count(), 1);
    }

    #[test]
    fn test_switch_to_mip_removes_shading_stages() {
        let library = ShaderLibrary::with_placeholders();
        let mut backend = SoftwareBackend::new();
        let mut machine = ShaderVariantMachine::new();
        let composite = ShaderVariant::select(&request(BlendMode::Composite)).expect("supported");
        machine.transition(composite, &library, &mut backend).expect("link");

        let mip = ShaderVariant::select(&request(BlendMode::MaximumIntensity)).expect("supported");
        let delta = machine.transition(mip, &library, &mut backend).expect("relink");
        assert_eq!(delta.removed, vec![ShaderStage::Component, ShaderStage::Shade]);
        assert_eq!(delta.replaced, vec![ShaderStage::Trace, ShaderStage::Cropping]);

        let back = machine.transition(composite, &library, &mut backend).expect("relink");
        assert_eq!(back.added, vec![ShaderStage::Component, ShaderStage::Shade]);
    }

    #[test]
    fn test_missing_source_invalidates_program() {
        let mut library = ShaderLibrary::new();
        library.insert("base/main", "// base");
        let mut backend = SoftwareBackend::new();
        let mut machine = ShaderVariantMachine::new();
        let v = ShaderVariant::select(&request(BlendMode::Composite)).expect("supported");
        let err = machine
            .transition(v, &library, &mut backend)
            .expect_err("sources missing");
        assert!(matches!(err, RenderError::ShaderLink(_)));
        assert!(!machine.is_valid());
    }

    #[test]
    fn test_builtin_library_covers_every_key() {
        let library = ShaderLibrary::builtin();
        for key in VariantTable::new().all_keys() {
            assert!(library.source(key).is_some(), "no builtin source for {key}");
        }
    }

    #[test]
    fn test_builtin_composite_program_defines_each_hook_once() {
        let library = ShaderLibrary::builtin();
        let mut backend = SoftwareBackend::new();
        let mut machine = ShaderVariantMachine::new();
        let v = ShaderVariant::select(&request(BlendMode::Composite)).expect("supported");
        machine
            .transition(v, &library, &mut backend)
            .expect("links");
        let source = backend.linked_program().expect("linked").compose("");
        for hook in [
            "fn ray_setup(",
            "fn trace(",
            "fn cropping_accept(",
            "fn component_sample(",
            "fn shade_sample(",
            "fn fs_main(",
        ] {
            assert_eq!(source.matches(hook).count(), 1, "{hook}");
        }
    }

    #[test]
    fn test_backend_link_failure_is_reported() {
        let library = ShaderLibrary::with_placeholders();
        let mut backend = SoftwareBackend::new();
        backend.fail_links_containing("trace/mip");
        let mut machine = ShaderVariantMachine::new();
        let v = ShaderVariant::select(&request(BlendMode::MaximumIntensity)).expect("supported");
        assert!(machine.transition(v, &library, &mut backend).is_err());
        assert!(!machine.is_valid());

        let composite = ShaderVariant::select(&request(BlendMode::Composite)).expect("supported");
        machine
            .transition(composite, &library, &mut backend)
            .expect("composite links");
        assert!(machine.is_valid());
    }
}
