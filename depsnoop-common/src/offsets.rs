//! Byte offsets of the kernel structure fields the tracing program
//! dereferences.
//!
//! The kernel program walks `task_struct`, the file table and the
//! dentry/inode graph with raw probe reads, and those structures have
//! no stable layout across kernel builds. Userspace resolves the
//! offsets from `/sys/kernel/btf/vmlinux` before attaching and writes
//! the whole table into a read-only global of the program, so the
//! same bytecode runs on any BTF-enabled kernel.

/// Field offsets in bytes. The resolver fails attachment outright if
/// any member is missing, so the kernel program can assume a complete
/// table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelOffsets {
    /// `task_struct.files`
    pub task_files: u32,
    /// `task_struct.fs`
    pub task_fs: u32,
    /// `task_struct.real_parent`
    pub task_real_parent: u32,
    /// `task_struct.tgid`
    pub task_tgid: u32,
    /// `task_struct.exit_code`
    pub task_exit_code: u32,
    /// `files_struct.fdt`
    pub files_fdt: u32,
    /// `fdtable.fd` (pointer to the open-file array)
    pub fdt_fd: u32,
    /// `file.f_path`
    pub file_f_path: u32,
    /// `path.mnt`
    pub path_mnt: u32,
    /// `path.dentry`
    pub path_dentry: u32,
    /// `vfsmount.mnt_sb`
    pub vfsmount_mnt_sb: u32,
    /// `super_block.s_magic`
    pub sb_s_magic: u32,
    /// `dentry.d_parent`
    pub dentry_d_parent: u32,
    /// `dentry.d_name.name` (qstr flattened in)
    pub dentry_d_name_name: u32,
    /// `dentry.d_inode`
    pub dentry_d_inode: u32,
    /// `inode.i_ino`
    pub inode_i_ino: u32,
    /// `inode.i_rdev`
    pub inode_i_rdev: u32,
    /// `inode.i_mode`
    pub inode_i_mode: u32,
    /// `fs_struct.pwd`
    pub fs_pwd: u32,
}

impl KernelOffsets {
    /// All-zero table, the placeholder value of the kernel program's
    /// global before the loader overwrites it.
    pub const fn zeroed() -> KernelOffsets {
        KernelOffsets {
            task_files: 0,
            task_fs: 0,
            task_real_parent: 0,
            task_tgid: 0,
            task_exit_code: 0,
            files_fdt: 0,
            fdt_fd: 0,
            file_f_path: 0,
            path_mnt: 0,
            path_dentry: 0,
            vfsmount_mnt_sb: 0,
            sb_s_magic: 0,
            dentry_d_parent: 0,
            dentry_d_name_name: 0,
            dentry_d_inode: 0,
            inode_i_ino: 0,
            inode_i_rdev: 0,
            inode_i_mode: 0,
            fs_pwd: 0,
        }
    }
}
