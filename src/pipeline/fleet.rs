//! Pipeline fleet
//!
//! The [`PipelineFleet`] owns every [`OutputPipeline`] (and through it
//! every [`Output`]). Its one hard invariant: the set of enabled outputs
//! is never empty while compositing is on. When the last real output is
//! disabled or disappears, the fleet provisions a placeholder output so
//! windows always have somewhere to live; the placeholder is removed as
//! soon as a real output is enabled again.

use std::time::Instant;

use crate::backend::HardwareDevice;
use crate::error::{log_error, OptionExt, VesperError, VesperResult};
use crate::geometry::Rect;
use crate::output::{Output, OutputId};
use crate::pipeline::{OutputPipeline, PipelineChange};
use crate::render_loop::FrameSink;

#[derive(Debug, Default)]
pub struct PipelineFleet {
    pipelines: Vec<OutputPipeline>,
    next_id: u32,
    primary: Option<OutputId>,
}

impl PipelineFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next output ID; IDs are never reused within a session
    pub fn allocate_id(&mut self) -> OutputId {
        self.next_id += 1;
        OutputId::from_raw(self.next_id).unwrap_or_else(|| unreachable!("ids start at 1"))
    }

    pub fn get(&self, id: OutputId) -> Option<&OutputPipeline> {
        self.pipelines.iter().find(|p| p.id() == id)
    }

    pub fn get_mut(&mut self, id: OutputId) -> Option<&mut OutputPipeline> {
        self.pipelines.iter_mut().find(|p| p.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputPipeline> {
        self.pipelines.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OutputPipeline> {
        self.pipelines.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Mutable access to every output at once, for layout application
    pub fn outputs_mut(&mut self) -> Vec<&mut Output> {
        self.pipelines.iter_mut().map(|p| p.output_mut()).collect()
    }

    /// Enabled outputs, placeholders included
    pub fn enabled_outputs(&self) -> impl Iterator<Item = &Output> {
        self.pipelines
            .iter()
            .map(|p| p.output())
            .filter(|o| o.is_enabled())
    }

    /// Real (non-placeholder) enabled outputs
    fn real_enabled_count(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|p| p.output().is_enabled() && !p.output().is_placeholder())
            .count()
    }

    pub fn primary(&self) -> Option<OutputId> {
        self.primary
    }

    pub fn set_primary(&mut self, id: OutputId) -> VesperResult<()> {
        if self.get(id).is_none() {
            return Err(VesperError::OutputNotFound(id));
        }
        self.primary = Some(id);
        Ok(())
    }

    /// Outputs whose global geometry intersects `rect`
    pub fn outputs_intersecting(&self, rect: Rect) -> impl Iterator<Item = &Output> {
        self.enabled_outputs()
            .filter(move |o| o.geometry().overlaps(&rect))
    }

    /// Register a newly discovered output. Enabling a real output retires
    /// any placeholder.
    pub fn add_output(&mut self, output: Output) -> OutputId {
        let id = output.id();
        // externally minted IDs must advance the allocator, or a later
        // placeholder would reuse this ID after the output is removed
        self.next_id = self.next_id.max(id.get());
        tracing::info!("Output {} connected ({})", output.name(), id);
        if self.primary.is_none() && !output.is_placeholder() {
            self.primary = Some(id);
        }
        self.pipelines.push(OutputPipeline::new(output));
        if self.real_enabled_count() > 0 {
            self.retire_placeholders();
        }
        id
    }

    /// An output vanished from the hardware topology. Unlike a disable
    /// request, removal is not subject to validation; the hardware already
    /// decided. Returns the removed pipeline so the orchestrator can
    /// migrate state off it.
    pub fn remove_output(&mut self, id: OutputId) -> Option<OutputPipeline> {
        let index = self.pipelines.iter().position(|p| p.id() == id)?;
        let pipeline = self.pipelines.remove(index);
        tracing::info!("Output {} removed", pipeline.output().name());
        if self.primary == Some(id) {
            self.primary = self
                .pipelines
                .iter()
                .find(|p| p.output().is_enabled() && !p.output().is_placeholder())
                .map(|p| p.id());
        }
        self.ensure_non_empty();
        Some(pipeline)
    }

    /// Disable an output through the test-then-commit protocol. The
    /// remaining enabled set is re-tested as a batch; if the hardware
    /// rejects it, the first remaining output falls back to its preferred
    /// mode and the set is tried once more.
    pub fn disable_output(
        &mut self,
        device: &mut dyn HardwareDevice,
        id: OutputId,
    ) -> VesperResult<()> {
        {
            let pipeline = self
                .get_mut(id)
                .ok_or_log(|| VesperError::OutputNotFound(id))?;
            pipeline.queue_change(PipelineChange {
                active: Some(false),
                ..Default::default()
            });
        }

        let remaining: Vec<OutputId> = self
            .pipelines
            .iter()
            .filter(|p| p.id() != id && p.output().is_enabled() && !p.output().is_placeholder())
            .map(|p| p.id())
            .collect();

        if remaining.is_empty() {
            // last real output going away: commit the disable alone and
            // provision a placeholder
            if let Err(err) = self.commit_set(device, &[id]) {
                self.reconcile_after_failure();
                return Err(err);
            }
            self.output_disabled(id);
            self.ensure_non_empty();
            return Ok(());
        }

        let mut batch: Vec<OutputId> = Vec::with_capacity(remaining.len() + 1);
        batch.push(id);
        batch.extend(&remaining);

        if log_error(self.commit_set(device, &batch)).is_none() {
            // shared resources may not stretch across the remaining set;
            // fall back the first remaining output to its preferred mode
            for &member in &batch {
                if let Some(p) = self.get_mut(member) {
                    p.revert_pending_changes();
                }
            }
            let fallback = remaining[0];
            {
                let pipeline = self.get_mut(id).ok_or(VesperError::OutputNotFound(id))?;
                pipeline.queue_change(PipelineChange {
                    active: Some(false),
                    ..Default::default()
                });
            }
            {
                let pipeline = self
                    .get_mut(fallback)
                    .ok_or(VesperError::OutputNotFound(fallback))?;
                let preferred = pipeline.output().preferred_mode_index();
                tracing::warn!(
                    "Output {}: falling back to preferred mode after rejected topology",
                    pipeline.output().name()
                );
                pipeline.queue_change(PipelineChange {
                    mode_index: Some(preferred),
                    transform: Some(crate::geometry::Transform::Normal),
                    ..Default::default()
                });
            }
            if let Err(err) = self.commit_set(device, &batch) {
                self.reconcile_after_failure();
                return Err(err);
            }
        }

        self.output_disabled(id);
        self.ensure_non_empty();
        Ok(())
    }

    /// Re-enable a previously disabled output; retires placeholders on
    /// success.
    pub fn enable_output(
        &mut self,
        device: &mut dyn HardwareDevice,
        id: OutputId,
    ) -> VesperResult<()> {
        {
            let pipeline = self
                .get_mut(id)
                .ok_or_log(|| VesperError::OutputNotFound(id))?;
            if pipeline.output().is_placeholder() {
                return Err(VesperError::InvalidOperation(
                    "placeholder outputs cannot be enabled explicitly".into(),
                ));
            }
            pipeline.queue_change(PipelineChange {
                active: Some(true),
                ..Default::default()
            });
        }
        if let Err(err) = self.commit_set(device, &[id]) {
            self.reconcile_after_failure();
            return Err(err);
        }
        if let Some(pipeline) = self.get_mut(id) {
            pipeline.output_mut().set_enabled(true);
        }
        if self.primary.is_none() {
            self.primary = Some(id);
        }
        self.retire_placeholders();
        Ok(())
    }

    /// Poll every pipeline's debounced power-off deadline
    pub fn process_power_off(
        &mut self,
        device: &mut dyn HardwareDevice,
        now: Instant,
    ) -> VesperResult<()> {
        for index in 0..self.pipelines.len() {
            if let Err(err) = self.pipelines[index].process_power_off(device, now) {
                self.reconcile_after_failure();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Display power management for one output. A failed commit marks the
    /// pipeline failed, so fleet invariants are reconciled before the error
    /// propagates.
    pub fn set_dpms(
        &mut self,
        device: &mut dyn HardwareDevice,
        id: OutputId,
        on: bool,
        now: Instant,
    ) -> VesperResult<()> {
        let pipeline = self
            .get_mut(id)
            .ok_or_log(|| VesperError::OutputNotFound(id))?;
        if let Err(err) = pipeline.set_dpms(device, on, now) {
            self.reconcile_after_failure();
            return Err(err);
        }
        Ok(())
    }

    /// Earliest pending power-off deadline across the fleet, for the
    /// embedder's timer
    pub fn next_power_off_deadline(&self) -> Option<Instant> {
        self.pipelines
            .iter()
            .filter_map(|p| p.power_off_deadline())
            .min()
    }

    /// Inhibit every render loop (session switch-away, suspend)
    pub fn inhibit_all(&mut self) {
        for pipeline in &mut self.pipelines {
            pipeline.render_loop_mut().inhibit();
        }
    }

    /// Uninhibit every render loop; queued repaints fire through `sink`
    pub fn uninhibit_all(&mut self, now: Instant, sink: &mut dyn FrameSink) {
        for pipeline in &mut self.pipelines {
            pipeline.render_loop_mut().uninhibit(now, sink);
        }
    }

    /// Test and commit the pending configurations of the given pipelines as
    /// one atomic batch
    fn commit_set(
        &mut self,
        device: &mut dyn HardwareDevice,
        ids: &[OutputId],
    ) -> VesperResult<()> {
        let tested = {
            let members: Vec<&OutputPipeline> = self
                .pipelines
                .iter()
                .filter(|p| ids.contains(&p.id()))
                .collect();
            OutputPipeline::test_commit(device, &members)?
        };
        for &id in ids {
            let pipeline = self
                .get_mut(id)
                .ok_or_log(|| VesperError::OutputVanished(id))?;
            pipeline.apply_pending_changes(device, &tested)?;
        }
        Ok(())
    }

    /// A failed commit disables outputs behind the fleet's back (the
    /// pipeline marks them failed); restore the primary and the non-empty
    /// invariant before handing the error up.
    fn reconcile_after_failure(&mut self) {
        let primary_live = self
            .primary
            .and_then(|id| self.get(id))
            .map(|p| p.output().is_enabled())
            .unwrap_or(false);
        if !primary_live {
            self.primary = self
                .pipelines
                .iter()
                .find(|p| p.output().is_enabled() && !p.output().is_placeholder())
                .map(|p| p.id());
        }
        self.ensure_non_empty();
    }

    fn output_disabled(&mut self, id: OutputId) {
        if let Some(pipeline) = self.get_mut(id) {
            pipeline.output_mut().set_enabled(false);
        }
        if self.primary == Some(id) {
            self.primary = self
                .pipelines
                .iter()
                .find(|p| p.output().is_enabled() && !p.output().is_placeholder())
                .map(|p| p.id());
        }
    }

    /// Invariant: while compositing, the enabled set is never empty
    fn ensure_non_empty(&mut self) {
        if self.enabled_outputs().next().is_some() {
            return;
        }
        let id = self.allocate_id();
        tracing::info!("No enabled outputs left, provisioning placeholder {id}");
        self.pipelines.push(OutputPipeline::new(Output::placeholder(id)));
    }

    fn retire_placeholders(&mut self) {
        let before = self.pipelines.len();
        self.pipelines.retain(|p| !p.output().is_placeholder());
        if self.pipelines.len() != before {
            tracing::info!("Placeholder output retired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, CursorConstraints, GpuBuffer, StagedConfig};
    use crate::geometry::{Point, Size};
    use crate::output::{Mode, OutputCapabilities};

    /// Accepts everything unless told to reject tests or wedge commits
    struct PermissiveDevice {
        reject_tests: u32,
        fail_commits: bool,
    }

    impl PermissiveDevice {
        fn new() -> Self {
            Self {
                reject_tests: 0,
                fail_commits: false,
            }
        }
    }

    impl HardwareDevice for PermissiveDevice {
        fn name(&self) -> &str {
            "permissive"
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Virtual
        }

        fn test(&mut self, _batch: &[StagedConfig]) -> Result<(), String> {
            if self.reject_tests > 0 {
                self.reject_tests -= 1;
                return Err("shared lane budget exceeded".into());
            }
            Ok(())
        }

        fn commit(&mut self, _batch: &[StagedConfig]) -> Result<(), String> {
            if self.fail_commits {
                return Err("device wedged".into());
            }
            Ok(())
        }

        fn set_cursor_plane(
            &mut self,
            _output: OutputId,
            _buffer: Option<&GpuBuffer>,
            _position: Point,
        ) -> bool {
            true
        }

        fn cursor_constraints(&self) -> CursorConstraints {
            CursorConstraints {
                max_size: Size::new(256, 256),
            }
        }

        fn presentation_timestamp(&self) -> Instant {
            Instant::now()
        }
    }

    fn real_output(fleet: &mut PipelineFleet, name: &str) -> OutputId {
        let id = fleet.allocate_id();
        fleet.add_output(Output::new(
            id,
            name,
            format!("edid-{name}"),
            vec![Mode::new(Size::new(1920, 1080), 60_000, true)],
            OutputCapabilities::DPMS,
        ))
    }

    #[test]
    fn disabling_last_output_provisions_placeholder() {
        let mut device = PermissiveDevice::new();
        let mut fleet = PipelineFleet::new();
        let id = real_output(&mut fleet, "DP-1");

        fleet.disable_output(&mut device, id).unwrap();
        let enabled: Vec<_> = fleet.enabled_outputs().collect();
        assert_eq!(enabled.len(), 1);
        assert!(enabled[0].is_placeholder(), "a placeholder keeps the fleet non-empty");

        // a real output coming back retires the placeholder
        let id2 = real_output(&mut fleet, "HDMI-1");
        assert!(fleet.enabled_outputs().all(|o| !o.is_placeholder()));
        assert_eq!(fleet.primary(), Some(id2));
    }

    #[test]
    fn removal_provisions_placeholder_without_validation() {
        let mut device = PermissiveDevice::new();
        device.reject_tests = u32::MAX; // hardware gone, every test would fail
        let mut fleet = PipelineFleet::new();
        let id = real_output(&mut fleet, "DP-1");

        let removed = fleet.remove_output(id).expect("pipeline handed back");
        assert_eq!(removed.id(), id);
        assert!(fleet.enabled_outputs().any(|o| o.is_placeholder()));
    }

    #[test]
    fn rejected_topology_falls_back_first_remaining() {
        let mut device = PermissiveDevice::new();
        let mut fleet = PipelineFleet::new();
        let a = real_output(&mut fleet, "DP-1");
        let b = real_output(&mut fleet, "DP-2");

        // first batch test rejected, the retry with DP-2 on its preferred
        // mode passes
        device.reject_tests = 1;
        fleet.disable_output(&mut device, a).unwrap();

        assert!(!fleet.get(a).unwrap().output().is_enabled());
        assert!(fleet.get(b).unwrap().output().is_enabled());
        assert_eq!(fleet.primary(), Some(b));
    }

    #[test]
    fn wedged_disable_commit_still_leaves_an_enabled_output() {
        let mut device = PermissiveDevice::new();
        device.fail_commits = true;
        let mut fleet = PipelineFleet::new();
        let id = real_output(&mut fleet, "DP-1");

        let err = fleet.disable_output(&mut device, id).unwrap_err();
        assert!(matches!(err, VesperError::CommitFailed(..)));
        assert!(fleet.get(id).unwrap().is_failed());
        assert!(
            fleet.enabled_outputs().next().is_some(),
            "a placeholder steps in when the commit wedges the last output"
        );
    }

    #[test]
    fn wedged_power_off_commit_keeps_the_fleet_populated() {
        let mut device = PermissiveDevice::new();
        let mut fleet = PipelineFleet::new();
        let id = real_output(&mut fleet, "DP-1");
        let start = Instant::now();

        fleet.set_dpms(&mut device, id, false, start).unwrap();
        let deadline = fleet.next_power_off_deadline().expect("deadline armed");

        device.fail_commits = true;
        assert!(fleet.process_power_off(&mut device, deadline).is_err());
        assert!(fleet.get(id).unwrap().is_failed());
        assert!(
            fleet.enabled_outputs().next().is_some(),
            "the failed output is replaced, not left as an empty fleet"
        );
    }

    #[test]
    fn external_ids_advance_the_allocator() {
        let mut fleet = PipelineFleet::new();
        let external = OutputId::from_raw(7).unwrap();
        fleet.add_output(Output::new(
            external,
            "DP-1",
            "edid-DP-1",
            vec![Mode::new(Size::new(1920, 1080), 60_000, true)],
            OutputCapabilities::empty(),
        ));
        assert!(
            fleet.allocate_id().get() > external.get(),
            "ids handed out after an external registration are never reused"
        );
    }

    #[test]
    fn placeholder_cannot_be_enabled_explicitly() {
        let mut device = PermissiveDevice::new();
        let mut fleet = PipelineFleet::new();
        let id = real_output(&mut fleet, "DP-1");
        fleet.disable_output(&mut device, id).unwrap();

        let placeholder = fleet
            .iter()
            .find(|p| p.output().is_placeholder())
            .map(|p| p.id())
            .unwrap();
        assert!(matches!(
            fleet.enable_output(&mut device, placeholder),
            Err(VesperError::InvalidOperation(_))
        ));

        // the real output can come back, which retires the placeholder
        fleet.enable_output(&mut device, id).unwrap();
        assert!(fleet.enabled_outputs().all(|o| !o.is_placeholder()));
    }
}
