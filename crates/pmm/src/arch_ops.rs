//! 架构相关 PMM 操作 trait 定义和注册

use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关的 PMM 操作
///
/// 目前只需要 physmap 翻译，供空闲页填充校验器读写页面内容。
/// os crate 需要为具体架构实现此 trait。
pub trait ArchPmmOps: Send + Sync {
    /// 将物理地址转换为 physmap 中的虚拟地址
    fn paddr_to_vaddr(&self, paddr: u64) -> usize;
}

static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_arch_ops(ops: &'static dyn ArchPmmOps) {
    let ptr = ops as *const dyn ArchPmmOps;
    // SAFETY: fat pointer 的布局是 (data, vtable)
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn ArchPmmOps, (usize, usize)>(ptr) };
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
    ARCH_OPS_DATA.store(data, Ordering::Release);
}

/// 获取已注册的架构操作实现
///
/// # Panics
/// 如果尚未调用 [`register_arch_ops`] 注册实现，则 panic
#[inline]
pub fn arch_ops() -> &'static dyn ArchPmmOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        #[cfg(test)]
        {
            return &test_support::mock::physmem::MOCK_PHYS_MEM;
        }
        #[cfg(not(test))]
        panic!("pmm: ArchPmmOps not registered");
    }
    // SAFETY: data 和 vtable 是通过 register_arch_ops 设置的有效指针
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchPmmOps>((data, vtable)) }
}

#[cfg(test)]
mod test_mock {
    use super::ArchPmmOps;
    use test_support::mock::physmem::MockPhysMem;

    impl ArchPmmOps for MockPhysMem {
        fn paddr_to_vaddr(&self, paddr: u64) -> usize {
            MockPhysMem::paddr_to_vaddr(self, paddr)
        }
    }
}
