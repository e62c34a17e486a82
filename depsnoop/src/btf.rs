//! Kernel structure offset resolution.
//!
//! The kernel program dereferences `task_struct`, the file table and
//! the dentry/inode graph with raw probe reads; none of those layouts
//! are stable across kernel builds. The offsets are read from the
//! running kernel's BTF here and written into the program's read-only
//! globals before attachment, so one compiled object runs anywhere
//! BTF is available.

use anyhow::{anyhow, Context, Result};
use aya_obj::btf::{Btf, BtfKind, BtfType};
use depsnoop_common::KernelOffsets;

pub fn resolve_kernel_offsets() -> Result<KernelOffsets> {
    let btf = Btf::from_sys_fs().context("read /sys/kernel/btf/vmlinux")?;
    // d_name is an embedded qstr; the program wants the flattened
    // offset of the name pointer.
    let qstr_name = member_offset(&btf, "qstr", "name")?;
    Ok(KernelOffsets {
        task_files: member_offset(&btf, "task_struct", "files")?,
        task_fs: member_offset(&btf, "task_struct", "fs")?,
        task_real_parent: member_offset(&btf, "task_struct", "real_parent")?,
        task_tgid: member_offset(&btf, "task_struct", "tgid")?,
        task_exit_code: member_offset(&btf, "task_struct", "exit_code")?,
        files_fdt: member_offset(&btf, "files_struct", "fdt")?,
        fdt_fd: member_offset(&btf, "fdtable", "fd")?,
        file_f_path: member_offset(&btf, "file", "f_path")?,
        path_mnt: member_offset(&btf, "path", "mnt")?,
        path_dentry: member_offset(&btf, "path", "dentry")?,
        vfsmount_mnt_sb: member_offset(&btf, "vfsmount", "mnt_sb")?,
        sb_s_magic: member_offset(&btf, "super_block", "s_magic")?,
        dentry_d_parent: member_offset(&btf, "dentry", "d_parent")?,
        dentry_d_name_name: member_offset(&btf, "dentry", "d_name")? + qstr_name,
        dentry_d_inode: member_offset(&btf, "dentry", "d_inode")?,
        inode_i_ino: member_offset(&btf, "inode", "i_ino")?,
        inode_i_rdev: member_offset(&btf, "inode", "i_rdev")?,
        inode_i_mode: member_offset(&btf, "inode", "i_mode")?,
        fs_pwd: member_offset(&btf, "fs_struct", "pwd")?,
    })
}

fn member_offset(btf: &Btf, type_name: &str, member: &str) -> Result<u32> {
    let type_id = btf
        .id_by_type_name_kind(type_name, BtfKind::Struct)
        .with_context(|| format!("struct {type_name} not found in kernel BTF"))?;
    let ty = btf
        .type_by_id(type_id)
        .with_context(|| format!("kernel BTF id for {type_name} unreadable"))?;
    let st = match ty {
        BtfType::Struct(st) => st,
        _ => return Err(anyhow!("kernel BTF type {type_name} is not a struct")),
    };
    for m in &st.members {
        if btf.string_at(m.name_offset)? == member {
            return Ok((st.member_bit_offset(m) / 8) as u32);
        }
    }
    Err(anyhow!("field {type_name}.{member} not found in kernel BTF"))
}
