//! Bootloader/application dependency gate.
//!
//! External-flash layout changed between releases, so the bootloader and
//! the application must agree on where staged images live. Each layout is a
//! [`DependencyRecord`]; a version belongs to the newest record whose
//! `min_version` it reaches.
//!
//! The gate turns the device's current versions and the operator's
//! [`UpdateRequest`] into an ordered [`TransferPlan`], or refuses with a
//! [`Rejection`] before anything is written to the device.

use {
    crate::{
        dfu::{DeviceMode, DeviceVersionState, engine::TransferTarget},
        image::{
            BinaryImage, ImageKind,
            binary::{MAX_APPLICATION_SIZE, MAX_BOOTLOADER_SIZE},
        },
    },
    log::debug,
    std::cmp::Ordering,
    thiserror::Error,
};

/// Internal flash region the bootloader is installed into.
pub const BOOTLOADER_FLASH_REGION: u8 = 0;

/// Internal flash region applications are installed into.
pub const APPLICATION_FLASH_REGION: u8 = 2;

/// External-flash layout shared by a range of releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyRecord {
    /// First release using this layout.
    pub min_version: u32,
    /// External memory region id images are staged in.
    pub exmem_region: u32,
    /// Base write offset inside that region.
    pub exmem_base: u32,
    /// Base address for sector erases.
    pub erase_base: u32,
    /// Whether applications of this layout can install a new bootloader.
    pub bootloader_update_supported: bool,
}

/// Known layouts, newest first.
pub const DEPENDENCY_TABLE: &[DependencyRecord] = &[
    DependencyRecord {
        min_version: 4011,
        exmem_region: 0xFF01,
        exmem_base: 0x8000,
        erase_base: 0x10000,
        bootloader_update_supported: true,
    },
    DependencyRecord {
        min_version: 4005,
        exmem_region: 0xFF05,
        exmem_base: 0x0,
        erase_base: 0x2C00000,
        bootloader_update_supported: false,
    },
];

impl DependencyRecord {
    /// Record governing `version`.
    pub fn for_version(version: u32) -> Option<&'static Self> {
        DEPENDENCY_TABLE
            .iter()
            .find(|record| version >= record.min_version)
    }

    /// Where a bootloader image is staged.
    pub fn bootloader_target(&self) -> TransferTarget {
        TransferTarget {
            exmem_region: self.exmem_region,
            write_offset: self.exmem_base,
            erase_offset: self.erase_base,
            int_flash_region: BOOTLOADER_FLASH_REGION,
        }
    }

    /// Where an application image of `kind` is staged.
    ///
    /// Applications sit after the bootloader slot; the TG application sits
    /// after the factory application.
    pub fn application_target(&self, kind: ImageKind) -> TransferTarget {
        let mut skip = MAX_BOOTLOADER_SIZE as u32;
        if kind == ImageKind::ShipApp {
            skip += MAX_APPLICATION_SIZE as u32;
        }
        TransferTarget {
            exmem_region: self.exmem_region,
            write_offset: self.exmem_base + skip,
            erase_offset: self.erase_base + skip,
            int_flash_region: APPLICATION_FLASH_REGION,
        }
    }

    fn lookup(version: u32) -> Result<&'static Self, Rejection> {
        Self::for_version(version).ok_or(Rejection::UnknownVersion(version))
    }
}

/// Why an update was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Nothing to do.
    #[error("no firmware image given")]
    Empty,

    /// More images than one run can carry.
    #[error("at most two images can be updated in one run, got {0}")]
    TooManyImages(usize),

    /// Two images of the same kind.
    #[error("two {0} images given")]
    DuplicateKind(ImageKind),

    /// Both application personalities at once.
    #[error("the factory and TG applications cannot be updated in the same run")]
    TwoApplications,

    /// A version older than every known layout.
    #[error("version {0} has no dependency record")]
    UnknownVersion(u32),

    /// The device's bootloader belongs to a newer layout than its application.
    #[error(
        "device bootloader v{bootloader} and application v{application} are not compatible; downgrade the bootloader to below v{next_record} first"
    )]
    BootloaderAheadOfApplication {
        /// Running bootloader version.
        bootloader: u32,
        /// Running application version.
        application: u32,
        /// First release of the bootloader's layout.
        next_record: u32,
    },

    /// The device's application belongs to a newer layout than its bootloader.
    #[error(
        "device application v{application} needs bootloader v{required} or above (running v{bootloader}); supply a bootloader image with the application"
    )]
    BootloaderBehindApplication {
        /// Running bootloader version.
        bootloader: u32,
        /// Running application version.
        application: u32,
        /// First release of the application's layout.
        required: u32,
    },

    /// The running application cannot install bootloaders.
    #[error("the running application v{application} does not support bootloader updates")]
    BootloaderUpdateUnsupported {
        /// Running application version.
        application: u32,
    },

    /// A bootloader change across layouts without its application.
    #[error(
        "bootloader v{requested} belongs to record v{target} but the running application uses record v{current}; {} the bootloader together with a matching application",
        if target > current { "upgrade" } else { "downgrade" }
    )]
    BootloaderAloneAcrossRecord {
        /// Requested bootloader version.
        requested: u32,
        /// Record of the running application.
        current: u32,
        /// Record of the requested bootloader.
        target: u32,
    },

    /// An application older than the running layout.
    #[error(
        "{kind} v{requested} is below v{floor}, the first release of the running application's record; downgrading across records is not supported"
    )]
    ApplicationDowngrade {
        /// Requested application kind.
        kind: ImageKind,
        /// Requested version.
        requested: u32,
        /// First release of the running record.
        floor: u32,
    },

    /// An application change across layouts without a bootloader.
    #[error(
        "{kind} v{requested} moves to record v{target} from v{current}; a bootloader of v{target} or above must be updated with it"
    )]
    ApplicationAloneAcrossRecord {
        /// Requested application kind.
        kind: ImageKind,
        /// Requested version.
        requested: u32,
        /// Record of the running application.
        current: u32,
        /// Record of the requested application.
        target: u32,
    },

    /// The paired bootloader does not belong to the application's layout.
    #[error("bootloader v{bootloader} does not match record v{required} of {kind} v{application}")]
    BootloaderRecordMismatch {
        /// Requested bootloader version.
        bootloader: u32,
        /// Requested application kind.
        kind: ImageKind,
        /// Requested application version.
        application: u32,
        /// Record the bootloader must belong to.
        required: u32,
    },

    /// SMT simulation image set is wrong.
    #[error("SMT simulation needs exactly one factory and one TG application image")]
    SmtImagesRequired,

    /// SMT images belong to different layouts.
    #[error("factory v{factory} and TG application v{ship} belong to different records")]
    SmtRecordMismatch {
        /// Factory application version.
        factory: u32,
        /// TG application version.
        ship: u32,
    },

    /// SMT images cannot be staged by the running factory firmware.
    #[error(
        "images of record v{images} cannot be staged by the running firmware of record v{device}"
    )]
    SmtDeviceRecordMismatch {
        /// Record of the images.
        images: u32,
        /// Record of the running firmware.
        device: u32,
    },

    /// An operator-supplied checksum does not match the file.
    #[error("checksum of {name} is {actual:#x}, expected {expected:#x}")]
    ChecksumMismatch {
        /// Image file name.
        name: String,
        /// Checksum given by the operator.
        expected: u64,
        /// Checksum computed from the file.
        actual: u64,
    },
}

/// Images the operator asked to install.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    application: Option<BinaryImage>,
    bootloader: Option<BinaryImage>,
}

impl UpdateRequest {
    /// Sort one or two images into application and bootloader slots.
    pub fn from_images(images: Vec<BinaryImage>) -> Result<Self, Rejection> {
        match images.len() {
            0 => return Err(Rejection::Empty),
            1 | 2 => {},
            n => return Err(Rejection::TooManyImages(n)),
        }

        let mut request = Self {
            application: None,
            bootloader: None,
        };
        for image in images {
            if image.kind() == ImageKind::Bootloader {
                if request
                    .bootloader
                    .is_some()
                {
                    return Err(Rejection::DuplicateKind(ImageKind::Bootloader));
                }
                request.bootloader = Some(image);
            } else if let Some(existing) = &request.application {
                return Err(if existing.kind() == image.kind() {
                    Rejection::DuplicateKind(image.kind())
                } else {
                    Rejection::TwoApplications
                });
            } else {
                request.application = Some(image);
            }
        }
        Ok(request)
    }

    /// Requested application image.
    pub fn application(&self) -> Option<&BinaryImage> {
        self.application
            .as_ref()
    }

    /// Requested bootloader image.
    pub fn bootloader(&self) -> Option<&BinaryImage> {
        self.bootloader
            .as_ref()
    }
}

/// Commit action after an image is staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    /// Set the application update flag, then reboot into it.
    Application,
    /// Install the staged bootloader, optionally rebooting afterwards.
    Bootloader {
        /// Reboot once installed.
        reboot: bool,
    },
}

/// One image transfer within a plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// Image to stage.
    pub image: BinaryImage,
    /// Layout used for addressing.
    pub record: DependencyRecord,
    /// Staging location.
    pub target: TransferTarget,
    /// Commit action.
    pub finalize: Finalize,
}

impl PlanStep {
    pub(crate) fn bootloader(image: BinaryImage, record: DependencyRecord, reboot: bool) -> Self {
        Self {
            target: record.bootloader_target(),
            image,
            record,
            finalize: Finalize::Bootloader { reboot },
        }
    }

    pub(crate) fn application(image: BinaryImage, record: DependencyRecord) -> Self {
        Self {
            target: record.application_target(image.kind()),
            image,
            record,
            finalize: Finalize::Application,
        }
    }

    /// Whether the device reboots when this step completes.
    pub fn reboots(&self) -> bool {
        match self.finalize {
            Finalize::Application => true,
            Finalize::Bootloader { reboot } => reboot,
        }
    }

    /// Personality the device comes up in after this step, if it changes.
    pub fn boots_into(&self) -> Option<DeviceMode> {
        match (self.finalize, self.image.kind()) {
            (Finalize::Application, ImageKind::ShipApp) => Some(DeviceMode::TgApp),
            (Finalize::Application, ImageKind::FactoryApp) => Some(DeviceMode::Factory),
            _ => None,
        }
    }
}

/// Ordered image transfers.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    steps: Vec<PlanStep>,
}

impl TransferPlan {
    pub(crate) fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps
            .len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps
            .is_empty()
    }

    /// Whether any step installs a bootloader.
    pub fn installs_bootloader(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.finalize, Finalize::Bootloader { .. }))
    }
}

/// Decide whether and in which order `request` can be applied to `device`.
pub fn plan_update(
    device: &DeviceVersionState,
    request: UpdateRequest,
) -> Result<TransferPlan, Rejection> {
    let current = DependencyRecord::lookup(device.application)?;
    debug!(
        "Device bootloader v{} application v{} (record v{})",
        device.bootloader, device.application, current.min_version
    );

    let UpdateRequest {
        application,
        bootloader,
    } = request;

    let Some(application) = application else {
        let bootloader = bootloader.ok_or(Rejection::Empty)?;
        check_bootloader_alone(device, current, &bootloader)?;
        return Ok(TransferPlan::new(vec![PlanStep::bootloader(
            bootloader, *current, true,
        )]));
    };

    check_device_state(device, bootloader.is_some())?;

    let target = DependencyRecord::lookup(application.version())?;
    match target
        .min_version
        .cmp(&current.min_version)
    {
        Ordering::Less => Err(Rejection::ApplicationDowngrade {
            kind: application.kind(),
            requested: application.version(),
            floor: current.min_version,
        }),
        Ordering::Greater => {
            let Some(bootloader) = bootloader else {
                return Err(Rejection::ApplicationAloneAcrossRecord {
                    kind: application.kind(),
                    requested: application.version(),
                    current: current.min_version,
                    target: target.min_version,
                });
            };
            let bootloader_record = DependencyRecord::lookup(bootloader.version())?;
            if bootloader_record != target {
                return Err(Rejection::BootloaderRecordMismatch {
                    bootloader: bootloader.version(),
                    kind: application.kind(),
                    application: application.version(),
                    required: target.min_version,
                });
            }
            Ok(TransferPlan::new(vec![
                PlanStep::bootloader(bootloader, *target, false),
                PlanStep::application(application, *target),
            ]))
        },
        Ordering::Equal => match bootloader {
            None => Ok(TransferPlan::new(vec![PlanStep::application(
                application,
                *current,
            )])),
            Some(bootloader) => {
                check_bootloader_alone(device, current, &bootloader)?;
                Ok(TransferPlan::new(vec![
                    PlanStep::bootloader(bootloader, *current, false),
                    PlanStep::application(application, *current),
                ]))
            },
        },
    }
}

/// Refuse application updates the device's own version pair cannot take.
fn check_device_state(device: &DeviceVersionState, with_bootloader: bool) -> Result<(), Rejection> {
    let bootloader = DependencyRecord::lookup(device.bootloader)?;
    let application = DependencyRecord::lookup(device.application)?;

    match bootloader
        .min_version
        .cmp(&application.min_version)
    {
        Ordering::Equal => Ok(()),
        Ordering::Greater => Err(Rejection::BootloaderAheadOfApplication {
            bootloader: device.bootloader,
            application: device.application,
            next_record: bootloader.min_version,
        }),
        Ordering::Less if with_bootloader => Ok(()),
        Ordering::Less => Err(Rejection::BootloaderBehindApplication {
            bootloader: device.bootloader,
            application: device.application,
            required: application.min_version,
        }),
    }
}

/// A bootloader installed without a layout change.
fn check_bootloader_alone(
    device: &DeviceVersionState,
    current: &DependencyRecord,
    bootloader: &BinaryImage,
) -> Result<(), Rejection> {
    if !current.bootloader_update_supported {
        return Err(Rejection::BootloaderUpdateUnsupported {
            application: device.application,
        });
    }
    let target = DependencyRecord::lookup(bootloader.version())?;
    if target != current {
        return Err(Rejection::BootloaderAloneAcrossRecord {
            requested: bootloader.version(),
            current: current.min_version,
            target: target.min_version,
        });
    }
    Ok(())
}

/// Validated SMT simulation: both application images staged side by side.
#[derive(Debug, Clone)]
pub struct SmtPlan {
    /// Layout shared by the images and the running firmware.
    pub record: DependencyRecord,
    /// Factory application image.
    pub factory: BinaryImage,
    /// TG application image.
    pub ship: BinaryImage,
}

impl SmtPlan {
    /// Images with their staging targets, factory first.
    pub fn stages(&self) -> [(&BinaryImage, TransferTarget); 2] {
        [
            (
                &self.factory,
                self.record
                    .application_target(ImageKind::FactoryApp),
            ),
            (
                &self.ship,
                self.record
                    .application_target(ImageKind::ShipApp),
            ),
        ]
    }
}

/// Check an SMT simulation request: one factory and one TG application,
/// each with the checksum the operator expects.
pub fn plan_smt_simulation(
    device: &DeviceVersionState,
    images: Vec<(BinaryImage, u64)>,
) -> Result<SmtPlan, Rejection> {
    if images.len() != 2 {
        return Err(Rejection::SmtImagesRequired);
    }

    let mut factory = None;
    let mut ship = None;
    for (image, expected) in images {
        let slot = match image.kind() {
            ImageKind::FactoryApp => &mut factory,
            ImageKind::ShipApp => &mut ship,
            ImageKind::Bootloader => return Err(Rejection::SmtImagesRequired),
        };
        if slot.is_some() {
            return Err(Rejection::SmtImagesRequired);
        }
        *slot = Some((image, expected));
    }
    let (Some((factory, factory_sum)), Some((ship, ship_sum))) = (factory, ship) else {
        return Err(Rejection::SmtImagesRequired);
    };

    let factory_record = DependencyRecord::lookup(factory.version())?;
    let ship_record = DependencyRecord::lookup(ship.version())?;
    if factory_record != ship_record {
        return Err(Rejection::SmtRecordMismatch {
            factory: factory.version(),
            ship: ship.version(),
        });
    }
    let current = DependencyRecord::lookup(device.application)?;
    if factory_record != current {
        return Err(Rejection::SmtDeviceRecordMismatch {
            images: factory_record.min_version,
            device: current.min_version,
        });
    }

    for (image, expected) in [(&factory, factory_sum), (&ship, ship_sum)] {
        let actual = crate::protocol::checksum::checksum(image.data());
        if actual != expected {
            return Err(Rejection::ChecksumMismatch {
                name: image
                    .name()
                    .to_string(),
                expected,
                actual,
            });
        }
    }

    Ok(SmtPlan {
        record: *current,
        factory,
        ship,
    })
}
