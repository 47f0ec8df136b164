//! # Disk leases
//!
//! Acquisition and release of the images behind the DISK attributes of a
//! VM, and the device targets those disks are given.
//!
//! The first OS disk gets the first target of its prefix, then come the
//! CDROMs (the context disk first) and last the other disks. Disks with an
//! explicit `TARGET` keep it, two disks cannot share one.
use std::collections::{BTreeSet, VecDeque};

use nimbus_models::models::{ImageType, Template, VectorAttribute};
use tracing::{debug, info, instrument, warn};

use crate::lease::{Lease, LeaseLog};
use crate::pool::Collaborators;
use crate::vm::{VirtualMachine, VmError, VmState};

pub mod target;

pub use target::assign_disk_targets;

/// Most DISK attributes a template can hold
pub const MAX_DISKS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Disk(usize),
    Context,
}

fn state_error() -> VmError {
    VmError::Validation("VM cannot be in DONE or FAILED state.".to_string())
}

impl VirtualMachine {
    /// Leases the image of every DISK, records the leases in `log` and
    /// assigns device targets
    pub(crate) fn acquire_disk_images(
        &mut self,
        ctx: &Collaborators<'_>,
        log: &mut LeaseLog,
    ) -> Result<(), VmError> {
        let num_disks = self.template.count("DISK");
        if num_disks > MAX_DISKS {
            return Err(VmError::Validation(format!(
                "Exceeded the maximum number of disks ({})",
                MAX_DISKS
            )));
        }

        let mut used = BTreeSet::new();
        let mut os = VecDeque::new();
        let mut cdrom = VecDeque::new();
        let mut datablock = VecDeque::new();

        if let Some(context) = self.template.vector_mut("CONTEXT")? {
            match context.get("TARGET") {
                Some(target) => {
                    used.insert(target.to_string());
                }
                None => cdrom.push_back((ctx.images.default_dev_prefix().to_string(), Slot::Context)),
            }
            context.replace("DISK_ID", num_disks);
        }

        let (vm_id, uid) = (self.oid, self.uid);
        for (i, disk) in self.template.vectors_mut("DISK")?.into_iter().enumerate() {
            disk.replace("DISK_ID", i);
            let attachment = ctx.images.disk_attribute(vm_id, disk, i, uid)?;
            if let Some(image_id) = attachment.image_id {
                log.record(Lease::Image(image_id));
            }

            if let Some(target) = disk.get("TARGET") {
                if !used.insert(target.to_string()) {
                    return Err(VmError::Conflict(format!(
                        "Two disks have defined the same target {}",
                        target
                    )));
                }
                continue;
            }

            let queued = (attachment.dev_prefix, Slot::Disk(i));
            match attachment.image_type {
                ImageType::Os if os.is_empty() => os.push_back(queued),
                ImageType::Os | ImageType::Datablock => datablock.push_back(queued),
                ImageType::Cdrom => cdrom.push_back(queued),
                _ => {}
            }
        }

        let assigned = assign_disk_targets(os.into_iter().chain(cdrom).chain(datablock), &mut used);

        let mut disks = self.template.vectors_mut("DISK")?;
        let mut context_target = None;
        for (slot, target) in assigned {
            match slot {
                Slot::Disk(i) => disks[i].replace("TARGET", target),
                Slot::Context => context_target = Some(target),
            }
        }

        if let Some(target) = context_target {
            if let Some(context) = self.template.vector_mut("CONTEXT")? {
                context.replace("TARGET", target);
            }
        }
        Ok(())
    }

    /// Leases the images of every DISK. The leases taken are given back
    /// when one of the disks cannot be set up.
    #[instrument(skip(self, ctx), fields(id = %self.oid))]
    pub fn get_disk_images(&mut self, ctx: &Collaborators<'_>) -> Result<(), VmError> {
        let mut log = LeaseLog::new(self.oid);
        match self.acquire_disk_images(ctx, &mut log) {
            Ok(()) => {
                log.commit();
                Ok(())
            }
            Err(e) => {
                log.rollback(ctx);
                Err(e)
            }
        }
    }

    /// Gives back the image, and the pending save-as image, of every DISK
    pub fn release_disk_images(&self, ctx: &Collaborators<'_>) {
        let failed = self.state == VmState::Failed;
        for disk in self.template.get("DISK").filter_map(|a| a.as_vector().ok()) {
            release_disk(ctx, self.oid, disk, failed);
        }
    }

    /// Highest disk id in use, and the targets taken, over DISK and CONTEXT
    pub fn get_disk_info(&self) -> (usize, BTreeSet<String>) {
        let mut max_disk_id = 0;
        let mut used = BTreeSet::new();

        let disks = self.template.get("DISK").filter_map(|a| a.as_vector().ok());
        let context = self
            .template
            .get("CONTEXT")
            .filter_map(|a| a.as_vector().ok())
            .take(1);

        for disk in disks.chain(context) {
            if let Some(target) = disk.get("TARGET") {
                used.insert(target.to_string());
            }
            if let Some(disk_id) = disk.get_parsed::<usize>("DISK_ID") {
                max_disk_id = max_disk_id.max(disk_id);
            }
        }

        (max_disk_id, used)
    }

    /// Builds the DISK to hot-plug from `template`, which must hold exactly
    /// one DISK. The new disk gets id `max_disk_id + 1` and its image is
    /// leased for `vm_id`.
    pub fn set_up_attach_disk(
        ctx: &Collaborators<'_>,
        vm_id: i64,
        template: &Template,
        used: &mut BTreeSet<String>,
        max_disk_id: usize,
        uid: i64,
    ) -> Result<(VectorAttribute, Option<i64>), VmError> {
        let single = || VmError::Validation("The template must contain one DISK attribute".to_string());
        if template.count("DISK") != 1 {
            return Err(single());
        }
        let mut disk = template.vector("DISK")?.cloned().ok_or_else(single)?;

        let disk_id = max_disk_id + 1;
        let attachment = ctx.images.disk_attribute(vm_id, &mut disk, disk_id, uid)?;

        match disk.get("TARGET").map(str::to_string) {
            Some(target) => {
                if !used.insert(target.clone()) {
                    if let Some(image_id) = attachment.image_id {
                        ctx.images.release_image(vm_id, image_id, false);
                    }
                    return Err(VmError::Conflict(format!(
                        "Target {} is already in use.",
                        target
                    )));
                }
            }
            None => {
                for (_, target) in assign_disk_targets([(attachment.dev_prefix, ())], used) {
                    disk.replace("TARGET", target);
                }
            }
        }

        Ok((disk, attachment.image_id))
    }

    /// Hot-plugs the DISK of `template`, returns the id of the new disk. The
    /// disk stays flagged until [VirtualMachine::clear_attach_disk].
    #[instrument(skip(self, ctx, template), fields(id = %self.oid))]
    pub fn attach_disk(
        &mut self,
        ctx: &Collaborators<'_>,
        template: &Template,
    ) -> Result<usize, VmError> {
        if self.state.is_final() {
            return Err(state_error());
        }

        let (max_disk_id, mut used) = self.get_disk_info();
        let (mut disk, image_id) =
            Self::set_up_attach_disk(ctx, self.oid, template, &mut used, max_disk_id, self.uid)?;

        disk.replace("ATTACH", "YES");
        info!(
            "Disk {} attached to VM {} as {}, image {:?}",
            max_disk_id + 1,
            self.oid,
            disk.get("TARGET").unwrap_or_default(),
            image_id
        );
        self.template.set(disk);
        Ok(max_disk_id + 1)
    }

    /// Flags the disk being hot-plugged
    pub fn set_attach_disk(&mut self, disk_id: usize) -> Result<(), VmError> {
        let oid = self.oid;
        let disk = self
            .template
            .vectors_mut("DISK")?
            .into_iter()
            .find(|disk| disk.get_parsed::<usize>("DISK_ID") == Some(disk_id))
            .ok_or_else(|| {
                VmError::NotFound(format!("The DISK {} does not exist for VM {}.", disk_id, oid))
            })?;
        disk.replace("ATTACH", "YES");
        Ok(())
    }

    pub fn get_attach_disk(&self) -> Option<&VectorAttribute> {
        self.template
            .get("DISK")
            .filter_map(|a| a.as_vector().ok())
            .find(|disk| disk.get("ATTACH") == Some("YES"))
    }

    pub fn clear_attach_disk(&mut self) {
        let attached = self
            .template
            .vectors_mut("DISK")
            .unwrap_or_default()
            .into_iter()
            .find(|disk| disk.get("ATTACH") == Some("YES"));

        if let Some(disk) = attached {
            disk.remove("ATTACH");
        }
    }

    /// Removes the flagged disk from the template, its image lease is kept
    pub fn delete_attach_disk(&mut self) -> Option<VectorAttribute> {
        self.template
            .remove_vector_if("DISK", |disk| disk.get("ATTACH") == Some("YES"))
    }

    /// Removes DISK `disk_id` and gives back its image leases
    #[instrument(skip(self, ctx), fields(id = %self.oid))]
    pub fn detach_disk(
        &mut self,
        ctx: &Collaborators<'_>,
        disk_id: usize,
    ) -> Result<VectorAttribute, VmError> {
        let disk = self
            .template
            .remove_vector_if("DISK", |disk| disk.get_parsed::<usize>("DISK_ID") == Some(disk_id))
            .ok_or_else(|| {
                VmError::NotFound(format!(
                    "The DISK {} does not exist for VM {}.",
                    disk_id, self.oid
                ))
            })?;

        release_disk(ctx, self.oid, &disk, self.state == VmState::Failed);
        info!("Disk {} detached from VM {}", disk_id, self.oid);
        Ok(disk)
    }

    /// Image of DISK `disk_id`, which is about to be saved as a new image
    pub fn get_image_from_disk(&self, disk_id: usize) -> Result<i64, VmError> {
        if self.state.is_final() {
            return Err(state_error());
        }

        let disk = self
            .template
            .get("DISK")
            .filter_map(|a| a.as_vector().ok())
            .find(|disk| disk.get_parsed::<usize>("DISK_ID") == Some(disk_id))
            .ok_or_else(|| {
                VmError::NotFound(format!(
                    "The DISK {} does not exist for VM {}.",
                    disk_id, self.oid
                ))
            })?;

        if disk.get("SAVE_AS").is_some() {
            return Err(VmError::Validation(format!(
                "The DISK {} is already going to be saved.",
                disk_id
            )));
        }

        if disk.get("PERSISTENT").is_some() {
            return Err(VmError::Validation(format!(
                "Source image for DISK {} is persistent.",
                disk_id
            )));
        }

        disk.get_parsed::<i64>("IMAGE_ID").ok_or_else(|| {
            VmError::Validation(format!(
                "The DISK {} does not have a valid IMAGE_ID.",
                disk_id
            ))
        })
    }

    /// Marks DISK `disk_id` to be saved as image `image_id` at `source`
    pub fn save_disk(&mut self, disk_id: usize, source: &str, image_id: i64) -> Result<(), VmError> {
        if self.state.is_final() {
            return Err(state_error());
        }

        let oid = self.oid;
        let disk = self
            .template
            .vectors_mut("DISK")?
            .into_iter()
            .find(|disk| disk.get_parsed::<usize>("DISK_ID") == Some(disk_id))
            .ok_or_else(|| {
                VmError::NotFound(format!("The DISK {} does not exist for VM {}.", disk_id, oid))
            })?;

        disk.replace("SAVE_AS_SOURCE", source);
        disk.replace("SAVE_AS", image_id);
        disk.replace("SAVE", "YES");
        debug!("DISK {} of VM {} will be saved as image {}", disk_id, oid, image_id);
        Ok(())
    }
}

fn release_disk(ctx: &Collaborators<'_>, vm_id: i64, disk: &VectorAttribute, failed: bool) {
    for key in ["IMAGE_ID", "SAVE_AS"] {
        match disk.get(key).map(|id| id.trim().parse::<i64>()) {
            Some(Ok(image_id)) => ctx.images.release_image(vm_id, image_id, failed),
            Some(Err(_)) => warn!("VM {} has a DISK with a wrong {}", vm_id, key),
            None => {}
        }
    }
}
