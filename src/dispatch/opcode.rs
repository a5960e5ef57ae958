//! Client command opcodes (spec section 4.H / 6). Numbering follows
//! `cmd.c`'s `CMD_NAMES` table exactly; the comment there that "exact
//! opcode numbering is an external-interface detail" just means new
//! opcodes may be appended, not that this ordering is arbitrary.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmdOpcode {
    Version = 0,
    AddLockspace = 1,
    DelLockspace = 2,
    Acquire = 3,
    Release = 4,
    Convert = 5,
    WriteLvb = 6,
    ReadLvb = 7,
    LockHostCount = 8,
    LockMode = 9,
    SetSignal = 10,
    SetKillpath = 11,
    SetHostId = 12,
    StopRenew = 13,
    StartRenew = 14,
    InjectFault = 15,
}

impl CmdOpcode {
    pub fn from_u32(v: u32) -> Option<Self> {
        use CmdOpcode::*;
        match v {
            0 => Some(Version),
            1 => Some(AddLockspace),
            2 => Some(DelLockspace),
            3 => Some(Acquire),
            4 => Some(Release),
            5 => Some(Convert),
            6 => Some(WriteLvb),
            7 => Some(ReadLvb),
            8 => Some(LockHostCount),
            9 => Some(LockMode),
            10 => Some(SetSignal),
            11 => Some(SetKillpath),
            12 => Some(SetHostId),
            13 => Some(StopRenew),
            14 => Some(StartRenew),
            15 => Some(InjectFault),
            _ => None,
        }
    }

    /// Debug name, mirrors `CMD_NAMES[cmd->cmd]`.
    pub fn name(self) -> &'static str {
        use CmdOpcode::*;
        match self {
            Version => "ILM_CMD_VERSION",
            AddLockspace => "ILM_CMD_ADD_LOCKSPACE",
            DelLockspace => "ILM_CMD_DEL_LOCKSPACE",
            Acquire => "ILM_CMD_ACQUIRE",
            Release => "ILM_CMD_RELEASE",
            Convert => "ILM_CMD_CONVERT",
            WriteLvb => "ILM_CMD_WRITE_LVB",
            ReadLvb => "ILM_CMD_READ_LVB",
            LockHostCount => "ILM_CMD_LOCK_HOST_COUNT",
            LockMode => "ILM_CMD_LOCK_MODE",
            SetSignal => "ILM_CMD_SET_SIGNAL",
            SetKillpath => "ILM_CMD_SET_KILLPATH",
            SetHostId => "ILM_CMD_SET_HOST_ID",
            StopRenew => "ILM_CMD_STOP_RENEW",
            StartRenew => "ILM_CMD_START_RENEW",
            InjectFault => "ILM_CMD_INJECT_FAULT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_known_opcode() {
        for v in 0..16u32 {
            let op = CmdOpcode::from_u32(v).unwrap();
            assert_eq!(op as u32, v);
        }
        assert!(CmdOpcode::from_u32(16).is_none());
    }
}
