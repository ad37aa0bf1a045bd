//! Virtual-Machine Control State (VMCS) related apis.

use super::Vmx;
use crate::{vm::Gpa, VmError};
use abyss::addressing::{Pa, Va};

/// Virtual Machine Control State.
///
/// This holds virtual machine specific information. The same layout is used
/// for the VMXON region.
///
/// ## Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, 24.2 FORMAT OF VMCS.
#[repr(C, align(4096))]
pub struct Vmcs {
    /// Bits 30:0: VMCS revision identifier
    /// Bit 31: shadow-VMCS indicator (see Section 24.10)
    rev_id: u32,
    /// VMX-abort indicator
    indicator: u32,
    /// VMCS data (implementation-specific format)
    _data: [u8; 0x1000 - 8],
}

impl Vmcs {
    /// Create a new region stamped with `rev_id` (bits 30:0 of IA32_VMX_BASIC).
    pub fn new(rev_id: u32) -> Self {
        Self {
            rev_id: rev_id & 0x7fff_ffff,
            indicator: 0,
            _data: [0; 0x1000 - 8],
        }
    }

    /// Revision identifier of the region.
    #[inline]
    pub fn rev_id(&self) -> u32 {
        self.rev_id
    }

    /// VMX-abort indicator written by the processor.
    #[inline]
    pub fn abort_indicator(&self) -> u32 {
        self.indicator
    }

    /// Host physical address of the region.
    #[inline]
    pub fn pa(&self) -> Pa {
        Va::of(self).into_pa()
    }

    /// Clear this VMCS.
    pub fn clear(&self, vmx: &dyn Vmx) -> Result<(), VmError> {
        vmx.vmclear(self.pa()).map_err(VmError::VmxOperationError)
    }

    /// Make this VMCS as a working VMCS.
    pub fn activate<'a>(&self, vmx: &'a dyn Vmx) -> Result<ActiveVmcs<'a>, VmError> {
        vmx.vmptrld(self.pa())
            .map_err(VmError::VmxOperationError)?;
        Ok(ActiveVmcs { vmx, pa: self.pa() })
    }
}

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 30-1. Vm-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation
    VmcallInVmxRoot,
    /// VMCLEAR with invalid physical address
    VmclearWithInvAddr,
    /// VMCLEAR with VMXON pointer
    VmclearWithVmxon,
    /// VMLAUNCH with non-clear VMCS
    VmlaunchWithNonclearVmcs,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff,
    /// VM entry with invalid control field(s)
    InvalidCs,
    /// VM entry with invalid host-state field(s)
    InvalidHostState,
    /// VMPTRLD with invalid physical address
    VmPtrLdWithInvAddr,
    /// VMPTRLD with VMXON pointer
    VmPtrLdWithVmxOn,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmPtrLdWithIncorrectRevId,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField,
    /// VMWRITE to read-only VMCS component
    WriteToRoField,
    /// VMXON executed in VMX root operation
    VmxonInVmxRoot,
    /// VM entry with invalid executive-VMCS pointer
    VmEntryWithInvalidExecVmcs,
    /// VM entry with non-launched executive VMCS
    VmEntryWithNonlaunchedExecVmcs,
    /// VM entry with executive-VMCS pointer not VMXON pointer
    VmEntryWithExecVmcs,
    /// VMCALL with non-clear VMCS
    VmcallWithNonclearVmcs,
    /// VMCALL with invalid VM-exit control fields
    VmcallWithInvVmexitCs,
    /// VMCALL with incorrect MSEG revision identifier
    VmcallWithIncorrectMsegRevId,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM
    VmxoffUnderDualMonitorTreatment,
    /// VMCALL with invalid SMM-monitor features
    VmcallWithInvSmmMonitor,
    /// VM entry with invalid VM-execution control fields in executive VMCS
    VmentryWithInvVmExecCs,
    /// VM entry with events blocked by MOV SS.
    VmentryWithEventBlockedByMovss,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid,
    /// Unknown error.
    Unknown,
}

impl InstructionError {
    /// Decode the VM-instruction error field.
    pub fn from_raw(v: u64) -> Self {
        match v {
            1 => Self::VmcallInVmxRoot,
            2 => Self::VmclearWithInvAddr,
            3 => Self::VmclearWithVmxon,
            4 => Self::VmlaunchWithNonclearVmcs,
            5 => Self::VmresumeWithNonlaunchedVmcs,
            6 => Self::VmresumeAfterVmxoff,
            7 => Self::InvalidCs,
            8 => Self::InvalidHostState,
            9 => Self::VmPtrLdWithInvAddr,
            10 => Self::VmPtrLdWithVmxOn,
            11 => Self::VmPtrLdWithIncorrectRevId,
            12 => Self::UnsupportedVmcsField,
            13 => Self::WriteToRoField,
            15 => Self::VmxonInVmxRoot,
            16 => Self::VmEntryWithInvalidExecVmcs,
            17 => Self::VmEntryWithNonlaunchedExecVmcs,
            18 => Self::VmEntryWithExecVmcs,
            19 => Self::VmcallWithNonclearVmcs,
            20 => Self::VmcallWithInvVmexitCs,
            22 => Self::VmcallWithIncorrectMsegRevId,
            23 => Self::VmxoffUnderDualMonitorTreatment,
            24 => Self::VmcallWithInvSmmMonitor,
            25 => Self::VmentryWithInvVmExecCs,
            26 => Self::VmentryWithEventBlockedByMovss,
            28 => Self::InvalidOperandToInveptInvvpid,
            _ => Self::Unknown,
        }
    }
}

/// Vmcs field.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    // 16bit fields
    Vpid = 0x00000000,
    PostedInterruptVector = 0x00000002,
    GuestEsSelector = 0x00000800,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    GuestDsSelector = 0x00000806,
    GuestFsSelector = 0x00000808,
    GuestGsSelector = 0x0000080A,
    GuestLdtrSelector = 0x0000080C,
    GuestTrSelector = 0x0000080E,
    GuestInterruptStatus = 0x00000810,
    HostEsSelector = 0x00000C00,
    HostCsSelector = 0x00000C02,
    HostSsSelector = 0x00000C04,
    HostDsSelector = 0x00000C06,
    HostFsSelector = 0x00000C08,
    HostGsSelector = 0x00000C0A,
    HostTrSelector = 0x00000C0C,
    // 64bit fields
    IoBitmapA = 0x00002000,
    IoBitmapB = 0x00002002,
    MsrBitmaps = 0x00002004,
    VmexitMsrStoreAddr = 0x00002006,
    VmexitMsrLoadAddr = 0x00002008,
    VmentryMsrLoadAddr = 0x0000200A,
    TscOffset = 0x00002010,
    VirtualApicPageAddr = 0x00002012,
    ApicAccessAddr = 0x00002014,
    PostedInterruptDescAddr = 0x00002016,
    Eptptr = 0x0000201A,
    EoiExitBitmap0 = 0x0000201C,
    EoiExitBitmap1 = 0x0000201E,
    EoiExitBitmap2 = 0x00002020,
    EoiExitBitmap3 = 0x00002022,
    GuestPhysicalAddr = 0x00002400,
    GuestLinkPointer = 0x00002800,
    GuestIa32Debugctl = 0x00002802,
    GuestIa32Pat = 0x00002804,
    GuestIa32Efer = 0x00002806,
    HostIa32Pat = 0x00002C00,
    HostIa32Efer = 0x00002C02,
    // 32bit fields
    PinBasedExecControls = 0x00004000,
    ProcessorBasedVmexecControls = 0x00004002,
    ExceptionBitmap = 0x00004004,
    PageFaultErrCodeMask = 0x00004006,
    PageFaultErrCodeMatch = 0x00004008,
    Cr3TargetCount = 0x0000400A,
    VmexitControls = 0x0000400C,
    VmexitMsrStoreCount = 0x0000400E,
    VmexitMsrLoadCount = 0x00004010,
    VmentryControls = 0x00004012,
    VmentryMsrLoadCount = 0x00004014,
    VmentryInterruptionInfo = 0x00004016,
    VmentryExceptionErrCode = 0x00004018,
    VmentryInstructionLength = 0x0000401A,
    TprThreshold = 0x0000401C,
    SecondaryVmexecControls = 0x0000401E,
    InstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    VmexitInterruptionInfo = 0x00004404,
    VmexitInterruptionErrCode = 0x00004406,
    IdtVectoringInfo = 0x00004408,
    IdtVectoringErrCode = 0x0000440A,
    VmexitInstructionLength = 0x0000440C,
    VmexitInstructionInfo = 0x0000440E,
    GuestEsLimit = 0x00004800,
    GuestCsLimit = 0x00004802,
    GuestSsLimit = 0x00004804,
    GuestDsLimit = 0x00004806,
    GuestFsLimit = 0x00004808,
    GuestGsLimit = 0x0000480A,
    GuestLdtrLimit = 0x0000480C,
    GuestTrLimit = 0x0000480E,
    GuestGdtrLimit = 0x00004810,
    GuestIdtrLimit = 0x00004812,
    GuestEsAccessRights = 0x00004814,
    GuestCsAccessRights = 0x00004816,
    GuestSsAccessRights = 0x00004818,
    GuestDsAccessRights = 0x0000481A,
    GuestFsAccessRights = 0x0000481C,
    GuestGsAccessRights = 0x0000481E,
    GuestLdtrAccessRights = 0x00004820,
    GuestTrAccessRights = 0x00004822,
    GuestInterruptibilityState = 0x00004824,
    GuestActivityState = 0x00004826,
    GuestIa32SysenterCsMsr = 0x0000482A,
    GuestPreemptionTimerValue = 0x0000482E,
    HostIa32SysenterCsMsr = 0x00004C00,
    // natural-width fields
    Cr0GuestHostMask = 0x00006000,
    Cr4GuestHostMask = 0x00006002,
    Cr0ReadShadow = 0x00006004,
    Cr4ReadShadow = 0x00006006,
    VmexitQualification = 0x00006400,
    GuestLinearAddr = 0x0000640A,
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestEsBase = 0x00006806,
    GuestCsBase = 0x00006808,
    GuestSsBase = 0x0000680A,
    GuestDsBase = 0x0000680C,
    GuestFsBase = 0x0000680E,
    GuestGsBase = 0x00006810,
    GuestLdtrBase = 0x00006812,
    GuestTrBase = 0x00006814,
    GuestGdtrBase = 0x00006816,
    GuestIdtrBase = 0x00006818,
    GuestDr7 = 0x0000681A,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    GuestPendingDbgExceptions = 0x00006822,
    GuestIa32SysenterEspMsr = 0x00006824,
    GuestIa32SysenterEipMsr = 0x00006826,
    HostCr0 = 0x00006C00,
    HostCr3 = 0x00006C02,
    HostCr4 = 0x00006C04,
    HostFsBase = 0x00006C06,
    HostGsBase = 0x00006C08,
    HostTrBase = 0x00006C0A,
    HostGdtrBase = 0x00006C0C,
    HostIdtrBase = 0x00006C0E,
    HostIa32SysenterEspMsr = 0x00006C10,
    HostIa32SysenterEipMsr = 0x00006C12,
    HostRsp = 0x00006C14,
    HostRip = 0x00006C16,
}

/// A representation of active vmcs.
///
/// Reads and writes go to the VMCS at `pa`, which the constructor made
/// current on this pCPU.
#[derive(Clone, Copy)]
pub struct ActiveVmcs<'a> {
    vmx: &'a dyn Vmx,
    pa: Pa,
}

impl<'a> ActiveVmcs<'a> {
    /// Physical address of the active VMCS.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// The VMX backend.
    #[inline]
    pub fn vmx(&self) -> &'a dyn Vmx {
        self.vmx
    }

    /// Write to the vmcs field of the activated vmcs.
    #[inline]
    pub fn write(&self, field: Field, v: u64) -> Result<(), VmError> {
        self.vmx
            .vmwrite(self.pa, field, v)
            .map_err(VmError::VmxOperationError)
    }

    /// Read from the vmcs field of the activated vmcs.
    #[inline]
    pub fn read(&self, field: Field) -> Result<u64, VmError> {
        self.vmx
            .vmread(self.pa, field)
            .map_err(VmError::VmxOperationError)
    }

    /// Set `bits` in a 32-bit control field.
    pub fn set_bits(&self, field: Field, bits: u32) -> Result<(), VmError> {
        let v = self.read(field)?;
        self.write(field, v | bits as u64)
    }

    /// Clear `bits` in a 32-bit control field.
    pub fn clear_bits(&self, field: Field, bits: u32) -> Result<(), VmError> {
        let v = self.read(field)?;
        self.write(field, v & !(bits as u64))
    }

    /// The VM-instruction error of the last failed operation.
    pub fn instruction_error(&self) -> InstructionError {
        self.read(Field::InstructionError)
            .map(InstructionError::from_raw)
            .unwrap_or(InstructionError::Unknown)
    }

    fn parse_basic_reason(&self, reason: u16) -> Result<BasicExitReason, VmError> {
        let qualification = if needs_qualification(reason) {
            self.read(Field::VmexitQualification)?
        } else {
            0
        };
        Ok(match reason {
            0x0 => BasicExitReason::ExceptionOrNmi(InterruptionInfo::decode(
                self.read(Field::VmexitInterruptionInfo)? as u32,
            )),
            // 24.9.2 Information for VM Exits Due to Vectored Events
            0x1 => BasicExitReason::ExternalInt(InterruptionInfo::decode(
                self.read(Field::VmexitInterruptionInfo)? as u32,
            )),
            0x2 => BasicExitReason::TripleFault,
            0x3 => BasicExitReason::InitSignal,
            0x4 => BasicExitReason::StartupIpi {
                vector: qualification as u8,
            },
            0x5 => BasicExitReason::IoSmi,
            0x6 => BasicExitReason::OtherSmi,
            0x7 => BasicExitReason::InterruptWindow,
            0x8 => BasicExitReason::NmiWindow,
            0x9 => BasicExitReason::TaskSwitch,
            0xA => BasicExitReason::Cpuid,
            0xB => BasicExitReason::Getsec,
            0xC => BasicExitReason::Hlt,
            0xD => BasicExitReason::Invd,
            0xE => BasicExitReason::Invlpg,
            0xF => BasicExitReason::Rdpmc,
            0x10 => BasicExitReason::Rdtsc,
            0x11 => BasicExitReason::Rsm,
            0x12 => BasicExitReason::Vmcall,
            0x13 => BasicExitReason::Vmclear,
            0x14 => BasicExitReason::Vmlaunch,
            0x15 => BasicExitReason::Vmptrld,
            0x16 => BasicExitReason::Vmptrst,
            0x17 => BasicExitReason::Vmread,
            0x18 => BasicExitReason::Vmresume,
            0x19 => BasicExitReason::Vmwrite,
            0x1A => BasicExitReason::Vmxoff,
            0x1B => BasicExitReason::Vmxon,
            0x1C => BasicExitReason::MovCr(CrAccessQualification::decode(qualification)),
            0x1D => BasicExitReason::MovDr,
            0x1E => BasicExitReason::IoInstruction(IoQualification::decode(qualification)),
            0x1F => BasicExitReason::Rdmsr,
            0x20 => BasicExitReason::Wrmsr,
            0x21 => BasicExitReason::EntfailGuestState,
            0x22 => BasicExitReason::EntfailMsrLoading,
            0x24 => BasicExitReason::Mwait,
            0x25 => BasicExitReason::Mtf,
            0x27 => BasicExitReason::Monitor,
            0x28 => BasicExitReason::Pause,
            0x29 => BasicExitReason::EntfailMachineChk,
            0x2B => BasicExitReason::TprBelowThreshold,
            0x2C => BasicExitReason::ApicAccess,
            0x2D => BasicExitReason::VirtualizedEoi {
                vector: qualification as u8,
            },
            0x2E => BasicExitReason::AccessGdtrOrIdtr,
            0x2F => BasicExitReason::AccessLdtrOrTr,
            0x30 => BasicExitReason::EptViolation {
                qualification: EptViolationQualification::from_bits_truncate(qualification),
                fault_addr: Gpa::new(self.read(Field::GuestPhysicalAddr)? as usize),
            },
            0x31 => BasicExitReason::EptMisconfig,
            0x32 => BasicExitReason::Invept,
            0x33 => BasicExitReason::Rdtscp,
            0x34 => BasicExitReason::VmxPreemptTimer,
            0x35 => BasicExitReason::Invvpid,
            0x36 => BasicExitReason::Wbinvd,
            0x37 => BasicExitReason::Xsetbv,
            r => BasicExitReason::Unknown(r),
        })
    }

    /// Resolve the exit reason of the activated vmcs.
    pub fn exit_reason(&self) -> Result<ExitReason, VmError> {
        let reason = self.read(Field::VmexitReason)?;
        let basic = self.parse_basic_reason(reason as u16)?;
        Ok(match reason {
            reason if reason & 0x8000_0000 != 0 => ExitReason::EntryFailure(basic),
            reason if reason & 0x2000_0000 != 0 => ExitReason::ExitFromVmxRootOperation(basic),
            _ => ExitReason::BasicExitReason(basic),
        })
    }
}

/// Whether the exit with basic reason `reason` reports an exit qualification.
///
/// See Intel manual volume 3C, 28.2.1 Basic VM-Exit Information.
pub const fn needs_qualification(reason: u16) -> bool {
    matches!(
        reason,
        0x4 | 0x9 | 0xE | 0x1B | 0x1C | 0x1D | 0x1E | 0x2C | 0x2D | 0x2E | 0x2F | 0x30 | 0x32 | 0x35
    )
}

/// Interruption type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionType {
    /// External interrupt.
    ExternalInt,
    /// Non-maskable interrupt.
    Nmi,
    /// Hardware exception.
    HardwareException,
    /// Software interrupt (INT n).
    SoftwareInt,
    /// Privileged software exception.
    PrivSoftwareException,
    /// Software exception.
    SoftwareException,
    /// Other event.
    Other,
}

impl InterruptionType {
    /// Value of bits 10:8 of the interruption information.
    pub const fn bits(self) -> u32 {
        match self {
            Self::ExternalInt => 0,
            Self::Nmi => 2,
            Self::HardwareException => 3,
            Self::SoftwareInt => 4,
            Self::PrivSoftwareException => 5,
            Self::SoftwareException => 6,
            Self::Other => 7,
        }
    }
}

/// Interruption Information
///
/// See Table 24-18. Format of the VM-Exit Interruption-Information Field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptionInfo {
    /// Vector of interrupt or exception: BIT 7~0
    pub vector: u8,
    /// Interruption type: BIT 10~8
    pub interruption_type: InterruptionType,
    /// Error code is valid: BIT 11.
    pub error_code_valid: bool,
    /// NMI unblocking due to IRET: BIT 12.
    pub nmi_unblocked_by_iret: bool,
}

impl InterruptionInfo {
    /// Decode the field; `None` if the valid bit is clear.
    pub fn decode(info: u32) -> Option<Self> {
        if info & 0x8000_0000 == 0 {
            return None;
        }
        Some(Self {
            vector: info as u8,
            interruption_type: match (info >> 8) & 7 {
                0 => InterruptionType::ExternalInt,
                2 => InterruptionType::Nmi,
                3 => InterruptionType::HardwareException,
                4 => InterruptionType::SoftwareInt,
                5 => InterruptionType::PrivSoftwareException,
                6 => InterruptionType::SoftwareException,
                _ => InterruptionType::Other,
            },
            error_code_valid: info & (1 << 11) != 0,
            nmi_unblocked_by_iret: info & (1 << 12) != 0,
        })
    }

    /// Encode as a VM-entry interruption-information value.
    pub fn encode(&self) -> u32 {
        (1 << 31)
            | ((self.error_code_valid as u32) << 11)
            | (self.interruption_type.bits() << 8)
            | self.vector as u32
    }
}

/// Access type of a control-register access exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessType {
    /// MOV to CR.
    MovToCr = 0,
    /// MOV from CR.
    MovFromCr = 1,
    /// CLTS.
    Clts = 2,
    /// LMSW.
    Lmsw = 3,
}

/// Exit qualification for control-register accesses.
///
/// See Table 28-3. Exit Qualification for Control-Register Accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrAccessQualification {
    /// Bits 3:0: number of the control register.
    pub cr_num: u8,
    /// Bits 5:4: access type.
    pub access_type: CrAccessType,
    /// Bits 11:8: general purpose register operand.
    pub gpr: u8,
    /// Bits 31:16: LMSW source data.
    pub lmsw_source: u16,
}

impl CrAccessQualification {
    /// Decode the raw qualification.
    pub const fn decode(q: u64) -> Self {
        Self {
            cr_num: (q & 0xf) as u8,
            access_type: match (q >> 4) & 3 {
                0 => CrAccessType::MovToCr,
                1 => CrAccessType::MovFromCr,
                2 => CrAccessType::Clts,
                _ => CrAccessType::Lmsw,
            },
            gpr: ((q >> 8) & 0xf) as u8,
            lmsw_source: (q >> 16) as u16,
        }
    }
}

/// Direction of a port I/O access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// OUT: guest writes the port.
    Out = 0,
    /// IN: guest reads the port.
    In = 1,
}

/// Exit qualification for I/O instructions.
///
/// See Table 28-5. Exit Qualification for I/O Instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoQualification {
    /// Bits 2:0: size of access minus one.
    pub size_field: u8,
    /// Bit 3: direction.
    pub direction: IoDirection,
    /// Bit 4: string instruction.
    pub string: bool,
    /// Bit 5: REP prefixed.
    pub rep: bool,
    /// Bits 31:16: port number.
    pub port: u16,
}

impl IoQualification {
    /// Decode the raw qualification.
    pub const fn decode(q: u64) -> Self {
        Self {
            size_field: (q & 0x7) as u8,
            direction: if q & (1 << 3) != 0 {
                IoDirection::In
            } else {
                IoDirection::Out
            },
            string: q & (1 << 4) != 0,
            rep: q & (1 << 5) != 0,
            port: (q >> 16) as u16,
        }
    }

    /// Access width in bytes.
    #[inline]
    pub const fn bytes(&self) -> usize {
        self.size_field as usize + 1
    }
}

/// Possible list of basic vmexit reasons.
///
/// See Table C-1. Basic Exit Reasons for details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi(Option<InterruptionInfo>),
    /// External Int
    ///
    /// See Table 24-18. Format of the VM-Exit Interruption-Information Field
    ExternalInt(Option<InterruptionInfo>),
    TripleFault,
    InitSignal,
    StartupIpi {
        vector: u8,
    },
    IoSmi,
    OtherSmi,
    InterruptWindow,
    NmiWindow,
    TaskSwitch,
    Cpuid,
    Getsec,
    Hlt,
    Invd,
    Invlpg,
    Rdpmc,
    Rdtsc,
    Rsm,
    Vmcall,
    Vmclear,
    Vmlaunch,
    Vmptrld,
    Vmptrst,
    Vmread,
    Vmresume,
    Vmwrite,
    Vmxoff,
    Vmxon,
    MovCr(CrAccessQualification),
    MovDr,
    IoInstruction(IoQualification),
    Rdmsr,
    Wrmsr,
    EntfailGuestState,
    EntfailMsrLoading,
    Mwait,
    Mtf,
    Monitor,
    Pause,
    EntfailMachineChk,
    TprBelowThreshold,
    ApicAccess,
    VirtualizedEoi {
        vector: u8,
    },
    AccessGdtrOrIdtr,
    AccessLdtrOrTr,
    EptViolation {
        qualification: EptViolationQualification,
        fault_addr: Option<Gpa>,
    },
    EptMisconfig,
    Invept,
    Rdtscp,
    VmxPreemptTimer,
    Invvpid,
    Wbinvd,
    Xsetbv,
    Unknown(u16),
}

impl BasicExitReason {
    /// Whether the exit is caused by executing an instruction, i.e. the guest
    /// RIP must move past it once it is emulated.
    pub fn is_instruction(&self) -> bool {
        matches!(
            self,
            Self::Cpuid
                | Self::Getsec
                | Self::Hlt
                | Self::Invd
                | Self::Invlpg
                | Self::Rdpmc
                | Self::Rdtsc
                | Self::Vmcall
                | Self::Vmclear
                | Self::Vmlaunch
                | Self::Vmptrld
                | Self::Vmptrst
                | Self::Vmread
                | Self::Vmresume
                | Self::Vmwrite
                | Self::Vmxoff
                | Self::Vmxon
                | Self::MovCr(_)
                | Self::MovDr
                | Self::IoInstruction(_)
                | Self::Rdmsr
                | Self::Wrmsr
                | Self::Mwait
                | Self::Monitor
                | Self::Pause
                | Self::Invept
                | Self::Rdtscp
                | Self::Invvpid
                | Self::Wbinvd
                | Self::Xsetbv
        )
    }
}

bitflags::bitflags! {
    /// Exit Qualification for EPT Violations
    ///
    /// See Intel Manual volume 3C. Table 28-7. Exit Qualification for EPT Violations
    pub struct EptViolationQualification: u64 {
        /// Set if the access causing the EPT violation was a data read.
        const READ = 1 << 0;
        /// Set if the access causing the EPT violation was a data write.
        const WRITE = 1 << 1;
        /// Set if the access causing the EPT violation was an instruction fetch.
        const FETCH = 1 << 2;
        /// Whether the guest-physical address was readable.
        const READABLE = 1 << 3;
        /// Whether the guest-physical address was writeable.
        const WRITEABLE = 1 << 4;
        /// Whether the guest-physical address was executable.
        const EXECUTABLE = 1 << 5;
        /// Set if the guest linear-address field is valid.
        const LINEAR_VALID = 1 << 7;
        /// Set if the access is to the translation of a linear address.
        const TRANSLATED = 1 << 8;
        /// NMI unblocking due to IRET.
        const NMI_UNBLOCKING = 1 << 12;
    }
}

/// Enumeration of vmexit reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit during the run.
    BasicExitReason(BasicExitReason),
    /// Failed on vmlaunch or vmresume.
    EntryFailure(BasicExitReason),
    /// Exit from vmx root operation.
    ExitFromVmxRootOperation(BasicExitReason),
}

impl ExitReason {
    /// get basic exit reason of the exit reason.
    pub fn get_basic_reason(&self) -> &BasicExitReason {
        match self {
            Self::BasicExitReason(e)
            | Self::EntryFailure(e)
            | Self::ExitFromVmxRootOperation(e) => e,
        }
    }
}
