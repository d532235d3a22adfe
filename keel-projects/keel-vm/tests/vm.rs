use keel::{
    Kernel, KernelError,
    addressing::{PAGE_SIZE, PHYS_BASE, Va},
    config::SystemConfigurationBuilder,
    paging::PageDirectory,
};
use keel_vm::{MmStruct, Vm, frame::FrameOwner};
use std::sync::Arc;

fn boot(user_frames: usize, swap_sectors: usize) -> Arc<Kernel> {
    Kernel::boot(
        SystemConfigurationBuilder::new()
            .quiet(true)
            .user_frames(user_frames)
            .swap_sectors(swap_sectors)
            .build(),
    )
    .unwrap()
}

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

fn page_of(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}

#[test]
fn zero_pages_are_loaded_on_first_touch() {
    let kernel = boot(4, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let mm = MmStruct::new(vm.clone());
            mm.map_zero_page(va(0x1000_0000), true).unwrap();
            assert_eq!(mm.page_directory().mapped_pages(), 0);
            assert_eq!(vm.frames_in_use(), 0);

            let mut buf = [0xffu8; 8];
            mm.read_user(va(0x1000_0100), &mut buf).unwrap();
            assert_eq!(buf, [0; 8]);
            assert_eq!(mm.page_directory().mapped_pages(), 1);

            mm.write_user(va(0x1000_0ffe), b"hi").unwrap();
            mm.read_user(va(0x1000_0ffe), &mut buf[..2]).unwrap();
            assert_eq!(&buf[..2], b"hi");
            assert_eq!(
                mm.map_zero_page(va(0x1000_0000), false),
                Err(KernelError::InvalidArgument)
            );
            mm.destroy();
            assert_eq!(vm.frames_in_use(), 0);
        })
        .unwrap();
}

#[test]
fn segment_pages_read_the_file_and_zero_the_rest() {
    let kernel = boot(4, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let contents: Vec<u8> = (0..6000).map(|i| (i % 253) as u8 + 1).collect();
            kernel.fs().install("prog", &contents).unwrap();
            let file = Arc::new(kernel.fs().open("prog").unwrap());

            let mm = MmStruct::new(vm.clone());
            mm.map_segment_page(va(0x0804_8000), &file, 0, PAGE_SIZE, false)
                .unwrap();
            mm.map_segment_page(va(0x0804_9000), &file, PAGE_SIZE, 6000 - PAGE_SIZE, false)
                .unwrap();

            let mut image = vec![0u8; 2 * PAGE_SIZE];
            mm.read_user(va(0x0804_8000), &mut image).unwrap();
            assert_eq!(&image[..6000], &contents[..]);
            assert!(image[6000..].iter().all(|b| *b == 0));

            assert_eq!(
                mm.write_user(va(0x0804_8010), b"x"),
                Err(KernelError::InvalidAccess)
            );
            assert_eq!(
                mm.handle_page_fault(va(0x0804_8010), true),
                Err(KernelError::InvalidAccess)
            );
            mm.destroy();
        })
        .unwrap();
}

#[test]
fn overlapping_segments_share_a_page() {
    let kernel = boot(4, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            kernel.fs().install("prog", &[7u8; 300]).unwrap();
            let file = Arc::new(kernel.fs().open("prog").unwrap());
            let mm = MmStruct::new(vm.clone());
            mm.map_zero_page(va(0x0804_8000), false).unwrap();
            mm.map_segment_page(va(0x0804_8000), &file, 0, 100, false)
                .unwrap();
            mm.map_segment_page(va(0x0804_8000), &file, 0, 200, true)
                .unwrap();
            assert_eq!(mm.registered_pages(), 1);
            let entry = mm.find_page(va(0x0804_8abc)).unwrap();
            assert!(entry.writable);

            let mut buf = [0u8; 201];
            mm.read_user(va(0x0804_8000), &mut buf).unwrap();
            assert!(buf[..200].iter().all(|b| *b == 7));
            assert_eq!(buf[200], 0);
            mm.write_user(va(0x0804_8000), b"w").unwrap();
        })
        .unwrap();
}

#[test]
fn partially_overlapping_segments_keep_the_longer_read() {
    let kernel = boot(4, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let contents: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 200) as u8 + 1).collect();
            kernel.fs().install("prog", &contents).unwrap();
            let file = Arc::new(kernel.fs().open("prog").unwrap());
            let mm = MmStruct::new(vm.clone());
            // Read lengths count from the start of the page: the first
            // segment ends at 0x100, the second covers 0x200..0x300.
            mm.map_segment_page(va(0x0804_8000), &file, 0, 0x300, true)
                .unwrap();
            mm.map_segment_page(va(0x0804_8000), &file, 0, 0x100, false)
                .unwrap();
            assert_eq!(mm.registered_pages(), 1);
            assert!(mm.find_page(va(0x0804_8000)).unwrap().writable);

            let mut page = vec![0u8; PAGE_SIZE];
            mm.read_user(va(0x0804_8000), &mut page).unwrap();
            assert_eq!(&page[..0x300], &contents[..0x300]);
            assert!(page[0x300..].iter().all(|b| *b == 0));
        })
        .unwrap();
}

#[test]
fn faults_outside_registered_pages() {
    let kernel = boot(4, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let mm = MmStruct::new(vm.clone());
            mm.map_zero_page(va(0x1000_0000), false).unwrap();
            assert_eq!(
                mm.handle_page_fault(va(0x2000_0000), false),
                Err(KernelError::BadAddress)
            );
            assert_eq!(
                mm.handle_page_fault(va(PHYS_BASE), false),
                Err(KernelError::BadAddress)
            );
            assert_eq!(
                mm.handle_page_fault(va(0x1000_0000), true),
                Err(KernelError::InvalidAccess)
            );

            assert!(!mm.access_ok(va(0), false));
            assert!(!mm.access_ok(va(PHYS_BASE + 4), false));
            assert!(mm.access_ok(va(0x1000_0abc), false));
            assert!(!mm.access_ok(va(0x1000_0abc), true));

            let mut buf = [0u8; 4];
            assert_eq!(
                mm.read_user(va(0x1000_0ffe), &mut buf),
                Err(KernelError::BadAddress)
            );
            assert_eq!(
                mm.read_user(va(PHYS_BASE - 2), &mut buf),
                Err(KernelError::BadAddress)
            );
            assert_eq!(mm.read_user(va(0), &mut buf), Err(KernelError::BadAddress));
        })
        .unwrap();
}

#[test]
fn dirty_pages_survive_eviction_to_swap() {
    let kernel = boot(2, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let slots = vm.swap().free_slots();
            let mm = MmStruct::new(vm.clone());
            for i in 0..6 {
                let upage = va(0x1000_0000 + i * PAGE_SIZE);
                mm.map_zero_page(upage, true).unwrap();
                mm.write_user(upage, &page_of(i as u8 + 1)).unwrap();
                assert!(vm.frames_in_use() <= 2);
            }
            assert_eq!(kernel.machine().memory.free_user_frames(), 0);
            assert!(vm.swap().free_slots() < slots);

            for i in 0..6 {
                let mut buf = page_of(0);
                mm.read_user(va(0x1000_0000 + i * PAGE_SIZE), &mut buf)
                    .unwrap();
                assert_eq!(buf, page_of(i as u8 + 1), "page {i}");
            }
            assert_eq!(vm.resident_pages(mm.page_directory()).len(), 2);

            mm.destroy();
            assert_eq!(vm.frames_in_use(), 0);
            assert_eq!(vm.swap().free_slots(), slots);
            assert_eq!(kernel.machine().memory.free_user_frames(), 2);
        })
        .unwrap();
}

#[test]
fn clean_pages_are_dropped_instead_of_swapped() {
    let kernel = boot(1, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            kernel.fs().install("ro", &[3u8; 2 * PAGE_SIZE]).unwrap();
            let file = Arc::new(kernel.fs().open("ro").unwrap());
            let mm = MmStruct::new(vm.clone());
            for i in 0..2 {
                mm.map_segment_page(
                    va(0x0804_8000 + i * PAGE_SIZE),
                    &file,
                    i * PAGE_SIZE,
                    PAGE_SIZE,
                    false,
                )
                .unwrap();
            }
            let slots = vm.swap().free_slots();
            let mut byte = [0u8];
            for _ in 0..3 {
                mm.read_user(va(0x0804_8000), &mut byte).unwrap();
                mm.read_user(va(0x0804_9000), &mut byte).unwrap();
                assert_eq!(byte, [3]);
            }
            assert_eq!(vm.swap().free_slots(), slots);
        })
        .unwrap();
}

#[test]
fn full_swap_runs_out_of_memory() {
    let kernel = boot(1, 8);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            assert_eq!(vm.swap().free_slots(), 1);
            let mm = MmStruct::new(vm.clone());
            for i in 0..3 {
                mm.map_zero_page(va(0x1000_0000 + i * PAGE_SIZE), true)
                    .unwrap();
            }
            mm.write_user(va(0x1000_0000), b"a").unwrap();
            mm.write_user(va(0x1000_1000), b"b").unwrap();
            assert_eq!(vm.swap().free_slots(), 0);
            assert_eq!(
                mm.write_user(va(0x1000_2000), b"c"),
                Err(KernelError::NoMemory)
            );
            // The victim stays mapped with its contents.
            assert_eq!(mm.page_directory().mapped_pages(), 1);
            assert!(mm.page_directory().get_page(va(0x1000_1000)).is_some());
            assert!(mm.page_directory().is_dirty(va(0x1000_1000)));
            assert_eq!(vm.frames_in_use(), 1);
            let mut buf = [0u8];
            mm.read_user(va(0x1000_1000), &mut buf).unwrap();
            assert_eq!(&buf, b"b");
            mm.destroy();
            assert_eq!(vm.swap().free_slots(), 1);
        })
        .unwrap();
}

#[test]
fn pinned_frames_are_not_evicted() {
    let kernel = boot(1, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let kva = vm
                .get_free_frame(FrameOwner {
                    upage: va(0x1000_0000),
                    dir: PageDirectory::new(),
                    spt: Arc::default(),
                })
                .unwrap();
            let mm = MmStruct::new(vm.clone());
            mm.map_zero_page(va(0x2000_0000), true).unwrap();
            assert_eq!(
                mm.write_user(va(0x2000_0000), b"x"),
                Err(KernelError::NoMemory)
            );
            assert_eq!(mm.page_directory().mapped_pages(), 0);

            vm.free_frame(kva);
            mm.write_user(va(0x2000_0000), b"x").unwrap();
        })
        .unwrap();
}

#[test]
fn address_spaces_are_isolated() {
    let kernel = boot(1, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let a = MmStruct::new(vm.clone());
            let b = MmStruct::new(vm.clone());
            let upage = va(0x1000_0000);
            a.map_zero_page(upage, true).unwrap();
            b.map_zero_page(upage, true).unwrap();
            a.write_user(upage, b"first").unwrap();
            b.write_user(upage, b"second").unwrap();

            let mut buf = [0u8; 6];
            a.read_user(upage, &mut buf[..5]).unwrap();
            assert_eq!(&buf[..5], b"first");
            b.read_user(upage, &mut buf).unwrap();
            assert_eq!(&buf, b"second");

            a.destroy();
            b.read_user(upage, &mut buf).unwrap();
            assert_eq!(&buf, b"second");
        })
        .unwrap();
}

#[test]
fn mmap_writes_back_on_munmap() {
    let kernel = boot(4, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let fs = kernel.fs();
            fs.install("map", &[b'a'; 5000]).unwrap();
            let mut mm = MmStruct::new(vm.clone());
            let id = mm.mmap(fs.open("map").unwrap(), va(0x1000_0000)).unwrap();
            assert_eq!(mm.registered_pages(), 2);

            let mut buf = [0u8; 3];
            mm.read_user(va(0x1000_1000 + 900), &mut buf).unwrap();
            assert_eq!(&buf, b"aaa");
            // Past the end of the file, inside the last page.
            mm.read_user(va(0x1000_1000 + 1000), &mut buf).unwrap();
            assert_eq!(buf, [0; 3]);

            mm.write_user(va(0x1000_0000 + 10), b"XYZ").unwrap();
            mm.write_user(va(0x1000_1000 + 100), b"UVW").unwrap();
            mm.munmap(id).unwrap();
            assert_eq!(mm.munmap(id), Err(KernelError::NoSuchMapping));
            assert_eq!(mm.registered_pages(), 0);
            assert_eq!(vm.frames_in_use(), 0);
            assert_eq!(
                mm.read_user(va(0x1000_0000), &mut buf),
                Err(KernelError::BadAddress)
            );

            let file = fs.open("map").unwrap();
            assert_eq!(file.length(), 5000);
            file.read_at(&mut buf, 10);
            assert_eq!(&buf, b"XYZ");
            file.read_at(&mut buf, PAGE_SIZE + 100);
            assert_eq!(&buf, b"UVW");
            file.read_at(&mut buf, 13);
            assert_eq!(&buf, b"aaa");
        })
        .unwrap();
}

#[test]
fn destroy_writes_back_every_mapping() {
    let kernel = boot(4, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let fs = kernel.fs();
            fs.install("one", &[b'1'; 100]).unwrap();
            fs.install("two", &[b'2'; 100]).unwrap();
            let mut mm = MmStruct::new(vm.clone());
            mm.mmap(fs.open("one").unwrap(), va(0x1000_0000)).unwrap();
            mm.mmap(fs.open("two").unwrap(), va(0x2000_0000)).unwrap();
            mm.write_user(va(0x1000_0000), b"first").unwrap();
            mm.write_user(va(0x2000_0010), b"second").unwrap();
            assert_eq!(mm.mappings(), [0, 1]);

            mm.destroy();
            assert_eq!(vm.frames_in_use(), 0);

            let mut buf = [0u8; 6];
            let one = fs.open("one").unwrap();
            one.read_at(&mut buf[..5], 0);
            assert_eq!(&buf[..5], b"first");
            let two = fs.open("two").unwrap();
            two.read_at(&mut buf, 0x10);
            assert_eq!(&buf, b"second");
            two.read_at(&mut buf, 0);
            assert_eq!(&buf, b"222222");
        })
        .unwrap();
}

#[test]
fn evicted_mmap_pages_go_back_to_the_file() {
    let kernel = boot(1, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let fs = kernel.fs();
            fs.install("map", &[0u8; 2 * PAGE_SIZE]).unwrap();
            let slots = vm.swap().free_slots();
            let mut mm = MmStruct::new(vm.clone());
            mm.mmap(fs.open("map").unwrap(), va(0x1000_0000)).unwrap();
            mm.write_user(va(0x1000_0000), b"one").unwrap();
            mm.write_user(va(0x1000_1000), b"two").unwrap();
            assert_eq!(vm.swap().free_slots(), slots);

            let mut buf = [0u8; 3];
            fs.open("map").unwrap().read_at(&mut buf, 0);
            assert_eq!(&buf, b"one");
            mm.read_user(va(0x1000_0000), &mut buf).unwrap();
            assert_eq!(&buf, b"one");

            mm.destroy();
            fs.open("map").unwrap().read_at(&mut buf, PAGE_SIZE);
            assert_eq!(&buf, b"two");
        })
        .unwrap();
}

#[test]
fn mmap_rejects_bad_ranges() {
    let kernel = boot(4, 64);
    let vm = Vm::new(&kernel);
    kernel
        .run(|| {
            let fs = kernel.fs();
            fs.install("two", &[1u8; PAGE_SIZE + 1]).unwrap();
            fs.install("empty", &[]).unwrap();
            let mut mm = MmStruct::new(vm.clone());
            let open = |name| kernel.fs().open(name).unwrap();

            for addr in [0, 0x1000_0010, PHYS_BASE, PHYS_BASE - PAGE_SIZE] {
                assert_eq!(
                    mm.mmap(open("two"), va(addr)),
                    Err(KernelError::InvalidArgument),
                    "{addr:#x}"
                );
            }
            assert_eq!(
                mm.mmap(open("empty"), va(0x1000_0000)),
                Err(KernelError::InvalidArgument)
            );

            let first = mm.mmap(open("two"), va(0x1000_0000)).unwrap();
            assert_eq!(
                mm.mmap(open("two"), va(0x1000_1000)),
                Err(KernelError::InvalidArgument)
            );
            mm.map_zero_page(va(0x2000_1000), true).unwrap();
            assert_eq!(
                mm.mmap(open("two"), va(0x2000_0000)),
                Err(KernelError::InvalidArgument)
            );
            // Failed attempts leave nothing behind.
            assert_eq!(mm.registered_pages(), 3);
            assert_eq!(mm.mappings(), vec![first]);

            let mut byte = [0u8];
            mm.read_user(va(0x1000_1000), &mut byte).unwrap();
            assert_eq!(byte, [1]);
            let second = mm.mmap(open("two"), va(0x3000_0000)).unwrap();
            assert_ne!(first, second);
        })
        .unwrap();
}
