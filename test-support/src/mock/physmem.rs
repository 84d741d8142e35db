//! 模拟物理内存
//!
//! 每次 [`MockPhysMem::alloc_region`] 都分配一段互不重叠的“物理地址”，
//! 并以宿主堆内存作为其 physmap 映射，供并行运行的测试各自使用。

use std::sync::Mutex;

/// 模拟物理地址空间的起点
const PHYS_BASE: u64 = 0x8000_0000;

struct Region {
    base: u64,
    size: u64,
    vaddr: usize,
}

/// 模拟物理内存
pub struct MockPhysMem {
    next_base: Mutex<u64>,
    regions: Mutex<Vec<Region>>,
}

impl MockPhysMem {
    pub const fn new() -> Self {
        Self {
            next_base: Mutex::new(PHYS_BASE),
            regions: Mutex::new(Vec::new()),
        }
    }

    /// 分配一段 `size` 字节、按 `align` 对齐的物理区域，返回其物理基址。
    ///
    /// 区域在测试进程的生命周期内一直有效。
    pub fn alloc_region(&self, size: u64, align: u64) -> u64 {
        assert!(align.is_power_of_two());
        let base = {
            let mut next = self.next_base.lock().unwrap();
            let base = (*next + align - 1) & !(align - 1);
            // 区域之间留一个页的空洞
            *next = base + size + 4096;
            base
        };
        let backing: &'static mut [u8] = vec![0u8; size as usize].leak();
        self.regions.lock().unwrap().push(Region {
            base,
            size,
            vaddr: backing.as_mut_ptr() as usize,
        });
        base
    }

    /// physmap 翻译；未映射的地址会 panic
    pub fn paddr_to_vaddr(&self, paddr: u64) -> usize {
        let regions = self.regions.lock().unwrap();
        regions
            .iter()
            .find(|r| paddr >= r.base && paddr < r.base + r.size)
            .map(|r| r.vaddr + (paddr - r.base) as usize)
            .unwrap_or_else(|| panic!("paddr {:#x} is not backed by a mock region", paddr))
    }
}

impl Default for MockPhysMem {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_PHYS_MEM: MockPhysMem = MockPhysMem::new();
