use atomic_kernel::arch::HostedPlatform;
use atomic_kernel::fs::ramfs::RamFs;
use atomic_kernel::memory::fault::FaultKind;
use atomic_kernel::memory::{Memory, PageTableEntry};
use atomic_kernel::scheduler::ProcessId;
use atomic_kernel::{Kernel, KernelConfig};
use x86_64::structures::paging::PhysFrame;

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn boot(fs: &RamFs, frames: usize) -> Kernel<HostedPlatform> {
    let mut k = Kernel::boot(KernelConfig::with_frames(frames), Box::new(fs.clone()), HostedPlatform::new()).unwrap();
    k.fork().unwrap();
    k.pick_next();
    k
}

fn leaf_of(k: &Kernel<HostedPlatform>, pid: ProcessId, offset: u32) -> Option<PageTableEntry> {
    let p = k.process(pid)?;
    p.space.entry(&k.mem, p.linear(offset)).filter(|leaf| leaf.is_present())
}

#[test]
fn frames_are_conserved_and_zeroed_on_reuse() {
    let config = KernelConfig::with_frames(16);
    let mut mem = Memory::new(&config);
    let total = mem.stats().total;
    // one entry per outstanding reference
    let mut held: Vec<PhysFrame> = Vec::new();
    let mut rng = Lcg(0x5eed);

    for _ in 0..5000 {
        match rng.next() % 3 {
            0 => match mem.allocate_frame() {
                Some(frame) => {
                    assert!(mem.phys.page(frame).iter().all(|&b| b == 0));
                    mem.phys.page_mut(frame).fill(0xa5);
                    held.push(frame);
                }
                None => assert_eq!(mem.stats().free, 0),
            },
            1 if !held.is_empty() => {
                let frame = held.swap_remove(rng.next() as usize % held.len());
                mem.release_frame(frame);
            }
            2 if !held.is_empty() => {
                let frame = held[rng.next() as usize % held.len()];
                if mem.refcount(frame) < 255 {
                    mem.share_frame(frame);
                    held.push(frame);
                }
            }
            _ => {}
        }

        let stats = mem.stats();
        assert!(stats.used <= total);
        let mut distinct = held.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(stats.used, distinct.len());
    }
}

#[test]
fn shared_leaves_are_read_only_and_counted_once_per_space() {
    let fs = RamFs::new(1);
    let mut k = boot(&fs, 64);
    let init = k.current_pid();
    k.write_user(0x3000, b"parent").unwrap();
    let frame = leaf_of(&k, init, 0x3000).unwrap().frame();

    let a = k.fork().unwrap();
    let b = k.fork().unwrap();
    let holders: Vec<_> = [init, a, b]
        .iter()
        .filter_map(|&pid| leaf_of(&k, pid, 0x3000))
        .filter(|leaf| leaf.frame() == frame)
        .collect();
    assert_eq!(holders.len(), 3);
    assert!(holders.iter().all(|leaf| !leaf.is_writable()));
    assert_eq!(k.mem.refcount(frame), 3);

    // the writer gets a private copy; the others keep sharing
    k.write_user(0x3000, b"PARENT").unwrap();
    let copy = leaf_of(&k, init, 0x3000).unwrap();
    assert_ne!(copy.frame(), frame);
    assert!(copy.is_writable());
    assert_eq!(k.mem.refcount(frame), 2);
    assert_eq!(&k.mem.phys.page(frame)[..6], b"parent");
    assert_eq!(&k.mem.phys.page(copy.frame())[..6], b"PARENT");
}

#[test]
fn last_sharer_keeps_its_frame() {
    let fs = RamFs::new(1);
    let mut k = boot(&fs, 64);
    let init = k.current_pid();
    k.write_user(0x3000, b"only").unwrap();
    let frame = leaf_of(&k, init, 0x3000).unwrap().frame();

    let child = k.fork().unwrap();
    assert_eq!(k.mem.refcount(frame), 2);
    // child exits before touching the page
    k.current_mut().counter = 0;
    k.pick_next();
    assert_eq!(k.current_pid(), child);
    k.exit(atomic_kernel::scheduler::ExitStatus::exited(0));
    assert_eq!(k.current_pid(), init);
    assert_eq!(k.mem.refcount(frame), 1);

    let used = k.memory_stats().used;
    k.write_user(0x3000, b"ONLY").unwrap();
    let leaf = leaf_of(&k, init, 0x3000).unwrap();
    assert_eq!(leaf.frame(), frame);
    assert!(leaf.is_writable());
    assert_eq!(k.memory_stats().used, used);
}

#[test]
fn heap_pages_fault_in_zeroed_exactly_once() {
    let fs = RamFs::new(1);
    let (inode, header) = fs.add_program(&[0x90; 100], &[], 0x1000, 0);
    let mut k = boot(&fs, 32);
    k.exec(inode, header).unwrap();
    let heap = 0x40_0000;

    let used = k.memory_stats().used;
    let mut buf = [0xffu8; 16];
    k.read_user(heap, &mut buf).unwrap();
    assert_eq!(buf, [0; 16]);
    let after_first = k.memory_stats().used;
    assert_eq!(after_first, used + 2);

    let linear = k.current().linear(heap);
    k.page_fault(linear, FaultKind::NotPresent).unwrap();
    k.read_user(heap + 100, &mut buf).unwrap();
    assert_eq!(buf, [0; 16]);
    assert_eq!(k.memory_stats().used, after_first);
}

#[test]
fn two_runs_of_one_file_share_a_code_page() {
    let fs = RamFs::new(1);
    let text: Vec<u8> = (0..2 * 4096u32).map(|i| i as u8).collect();
    let (inode, header) = fs.add_program(&text, &[], 0, 0);
    let mut k = boot(&fs, 64);
    let init = k.current_pid();
    k.exec(inode.clone(), header).unwrap();
    assert_eq!(k.read_user_u32(4096), Ok(u32::from_le_bytes([0, 1, 2, 3])));

    let child = k.fork().unwrap();
    k.current_mut().counter = 0;
    k.pick_next();
    assert_eq!(k.current_pid(), child);
    k.exec(inode, header).unwrap();
    assert_eq!(k.read_user_u32(4096), Ok(u32::from_le_bytes([0, 1, 2, 3])));

    let ours = leaf_of(&k, child, 4096).unwrap();
    let theirs = leaf_of(&k, init, 4096).unwrap();
    assert_eq!(ours.frame(), theirs.frame());
    assert_eq!(k.mem.refcount(ours.frame()), 2);
    assert!(!ours.is_writable() && !theirs.is_writable());
}
