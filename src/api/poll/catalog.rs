use std::ops::RangeInclusive;

/// Start of the speed/current/torque block
pub const BASE_BLOCK_ADDRESS: u16 = 2816;
pub const BASE_BLOCK_LEN: u16 = 3;

/// How a monitored point is fetched from the drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// Word `index` of the base block, read once per cycle for all its points
    BaseBlock { index: usize, signed: bool },
    Register32 { address: u16, signed: bool },
    Register16 { address: u16 },
    /// 4-register block, low pair at `address`, high pair at `address + 2`
    Composite64 { address: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointSpec {
    pub code: &'static str,
    pub label: &'static str,
    pub fetch: Fetch,
    /// Decoded values outside this range are treated as corrupted exchanges
    pub envelope: RangeInclusive<i64>,
}

impl PointSpec {
    pub fn admits(&self, value: i64) -> bool {
        self.envelope.contains(&value)
    }

    pub fn in_base_block(&self) -> bool {
        matches!(self.fetch, Fetch::BaseBlock { .. })
    }
}

pub static POINTS: [PointSpec; 6] = [
    PointSpec {
        code: "P0B-00",
        label: "speed",
        fetch: Fetch::BaseBlock {
            index: 0,
            signed: true,
        },
        envelope: -10_000..=10_000,
    },
    PointSpec {
        code: "P0B-01",
        label: "current",
        fetch: Fetch::BaseBlock {
            index: 1,
            signed: false,
        },
        envelope: 0..=2_000,
    },
    PointSpec {
        code: "P0B-02",
        label: "torque",
        fetch: Fetch::BaseBlock {
            index: 2,
            signed: true,
        },
        envelope: -1_000..=1_000,
    },
    PointSpec {
        code: "P0B-15",
        label: "temperature",
        fetch: Fetch::Register32 {
            address: 2831,
            signed: true,
        },
        envelope: -50..=200,
    },
    PointSpec {
        code: "P0B-24",
        label: "monitor",
        fetch: Fetch::Register16 { address: 2840 },
        envelope: 0..=50_000,
    },
    PointSpec {
        code: "P0B-58",
        label: "position counter",
        fetch: Fetch::Composite64 { address: 2874 },
        envelope: i64::MIN..=i64::MAX,
    },
];

pub fn lookup(code: &str) -> Option<&'static PointSpec> {
    POINTS.iter().find(|point| point.code == code)
}

pub fn codes() -> impl Iterator<Item = &'static str> {
    POINTS.iter().map(|point| point.code)
}
